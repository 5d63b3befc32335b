use std::{env, time::Duration};

use crate::error::{Result, StoreError};

pub const DEFAULT_API_BASE: &str = "http://localhost:5055";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the store treats the sync API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    /// Try the API, fall back to local storage on any failure.
    Hybrid,
    /// The API is required; nothing is read from or cached in local storage.
    ApiOnly,
    /// No API configured; every operation runs against local storage.
    Offline,
}

impl DbMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbMode::Hybrid => "hybrid",
            DbMode::ApiOnly => "api-only",
            DbMode::Offline => "offline",
        }
    }

    /// Whether remote failures may be answered from local storage.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, DbMode::ApiOnly)
    }

    /// Whether remote successes are mirrored into the local caches.
    pub fn caches_locally(&self) -> bool {
        matches!(self, DbMode::Hybrid)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base URL of the sync API, `None` when running fully offline.
    pub api_base: Option<String>,
    pub mode: DbMode,
    pub timeout: Duration,
    /// Connection string of the local SQLite key-value store.
    pub local_db_url: String,
}

impl StoreConfig {
    pub fn offline() -> Self {
        Self {
            api_base: None,
            mode: DbMode::Offline,
            timeout: DEFAULT_TIMEOUT,
            local_db_url: "sqlite::memory:".into(),
        }
    }

    pub fn hybrid(api_base: impl Into<String>) -> Self {
        Self {
            api_base: Some(trim_base(api_base.into())),
            mode: DbMode::Hybrid,
            ..Self::offline()
        }
    }

    pub fn api_only(api_base: impl Into<String>) -> Self {
        Self {
            mode: DbMode::ApiOnly,
            ..Self::hybrid(api_base)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reads `DB_API`, `DB_MODE`, `DB_TIMEOUT_MS` and `LOCAL_DB_PATH`.
    ///
    /// An unset `DB_API` points at the default LAN server; an empty value (or
    /// `none` / `offline`) disables the API entirely.
    pub fn from_env() -> Result<Self> {
        let api_base = match env::var("DB_API") {
            Err(_) => Some(DEFAULT_API_BASE.to_string()),
            Ok(v) => {
                let v = v.trim();
                if v.is_empty() || v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("offline") {
                    None
                } else {
                    Some(trim_base(v.to_string()))
                }
            }
        };
        let requested = env::var("DB_MODE").unwrap_or_else(|_| "hybrid".into());
        let mode = resolve_mode(&requested, api_base.is_some())?;
        let timeout = env::var("DB_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        let local_db_url = env::var("LOCAL_DB_PATH")
            .unwrap_or_else(|_| "sqlite://mathtutor_local.db".into());

        Ok(Self {
            api_base,
            mode,
            timeout,
            local_db_url,
        })
    }
}

fn resolve_mode(requested: &str, has_api: bool) -> Result<DbMode> {
    match (requested.trim().to_ascii_lowercase().as_str(), has_api) {
        ("hybrid" | "", true) => Ok(DbMode::Hybrid),
        ("hybrid" | "" | "offline", false) => Ok(DbMode::Offline),
        ("offline", true) => Ok(DbMode::Offline),
        ("api-only" | "api_only", true) => Ok(DbMode::ApiOnly),
        ("api-only" | "api_only", false) => Err(StoreError::Config(
            "DB_MODE=api-only requires DB_API".into(),
        )),
        (other, _) => Err(StoreError::Config(format!("unknown DB_MODE {other:?}"))),
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

/// Settings for the reference sync API server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://hybrid.db".into()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5055),
        }
    }
}

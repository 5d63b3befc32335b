use std::time::Duration;

use thiserror::Error;

/// Failure talking to the sync API. Every variant counts as "remote unavailable"
/// for the fallback decision.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("no sync API configured")]
    NotConfigured,

    #[error("{method} {path} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        method: &'static str,
        path: String,
        timeout: Duration,
    },

    #[error("{method} {path} failed: {status} - {body}")]
    Status {
        method: &'static str,
        path: String,
        status: http::StatusCode,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response from {path}: {message}")]
    Decode { path: String, message: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Username already exists")]
    UsernameTaken,

    #[error("Email already exists")]
    EmailTaken,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("local storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("corrupt local document under {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("local document version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_remote(&self) -> bool {
        matches!(self, StoreError::Remote(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

//! Persistent local key-value storage.
//!
//! The hybrid store keeps whole JSON documents under fixed string keys, the
//! same way a browser keeps them in `localStorage`. [`SqliteKv`] persists them
//! in a single SQLite table; [`MemoryKv`] keeps them in process memory.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    async fn close(&self) {}
}

pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    /// Opens (creating if missing) the database at `url`, e.g.
    /// `sqlite://mathtutor_local.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // In-memory databases are per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS local_kv (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
        )
        .execute(&pool)
        .await?;
        tracing::debug!(url, "local key-value store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM local_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_kv (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM local_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // substr instead of LIKE: keys contain `_`, a LIKE wildcard.
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM local_kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A poisoned map is still a consistent map: every write is a single insert/remove.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(kv: &dyn KvStore) {
        kv.set("mathtutor_data_classrooms_t1", "[]").await.unwrap();
        kv.set("mathtutor_data_classroom_c1", "{}").await.unwrap();
        kv.set("mathtutor_dataXclassrooms", "nope").await.unwrap();
        kv.set("mathtutor_data_classrooms_t1", "[1]").await.unwrap();

        assert_eq!(
            kv.get("mathtutor_data_classrooms_t1").await.unwrap().as_deref(),
            Some("[1]")
        );
        assert_eq!(
            kv.keys_with_prefix("mathtutor_data_classrooms_").await.unwrap(),
            vec!["mathtutor_data_classrooms_t1".to_string()]
        );

        kv.remove("mathtutor_data_classrooms_t1").await.unwrap();
        assert!(kv.get("mathtutor_data_classrooms_t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_kv_prefix_scan_and_overwrite() {
        exercise(&MemoryKv::new()).await;
    }

    #[tokio::test]
    async fn sqlite_kv_prefix_scan_treats_underscore_literally() {
        let kv = SqliteKv::connect("sqlite::memory:").await.unwrap();
        exercise(&kv).await;
        kv.close().await;
    }

    #[tokio::test]
    async fn sqlite_kv_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("local.db").display());

        let kv = SqliteKv::connect(&url).await.unwrap();
        kv.set("mathtutor_data", r#"{"version":1}"#).await.unwrap();
        kv.close().await;

        let kv = SqliteKv::connect(&url).await.unwrap();
        assert_eq!(
            kv.get("mathtutor_data").await.unwrap().as_deref(),
            Some(r#"{"version":1}"#)
        );
    }
}

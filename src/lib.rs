//! Hybrid offline/online data store for the math tutor, plus the sync API
//! server it talks to.
//!
//! [`HybridStore`] tries the sync API first and falls back to a local
//! key-value store when the API is unreachable, slow or failing, depending on
//! its [`DbMode`].

pub mod codes;
pub mod config;
pub mod db;
pub mod error;
pub mod local;
pub mod models;
pub mod remote;
pub mod routes;
pub mod storage;
pub mod store;

pub use config::{DbMode, StoreConfig};
pub use error::{RemoteError, Result, StoreError};
pub use storage::{KvStore, MemoryKv, SqliteKv};
pub use store::HybridStore;

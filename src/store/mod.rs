//! Progress store: the durable record of which captures have been delivered.
//!
//! The [`ProgressStore`] trait is the only durable shared state of the
//! pipeline. A record is appended only after the sink acknowledged the
//! document derived from that file, and records are never updated or
//! removed except by an explicit operator [`reset`](ProgressStore::reset).
//!
//! | Backend | Storage |
//! |---------|---------|
//! | [`FileProgressStore`] | append-only text file, one line per record |
//! | [`SqliteProgressStore`] | SQLite table via `sqlx` |
//! | [`InMemoryProgressStore`] | process memory, for tests |
//!
//! Implementations must be `Send + Sync`; a single coordinator owns a store.

pub mod file;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{ProgressBackend, ProgressConfig};
use crate::models::FileIdentity;

pub use file::FileProgressStore;
pub use memory::InMemoryProgressStore;
pub use sqlite::SqliteProgressStore;

/// One committed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    /// [`FileIdentity::key`] of the committed file.
    pub identity: String,
    pub committed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Short backend label for status output (`"file"`, `"sqlite"`, ...).
    fn backend(&self) -> &str;

    /// Whether this exact file version has been committed.
    async fn is_processed(&self, identity: &FileIdentity) -> Result<bool>;

    /// Durably record that the file's document was delivered.
    ///
    /// Atomic at record granularity: if this returns an error or the process
    /// dies mid-call, `is_processed` must not report the file as committed
    /// after a restart unless the record was fully written.
    async fn commit(&self, identity: &FileIdentity) -> Result<()>;

    /// Remove every record. Operator action, never called by the pipeline.
    async fn reset(&self) -> Result<()>;

    /// Number of committed records.
    async fn count(&self) -> Result<u64>;
}

/// Open the backend selected in `[progress]`.
pub async fn open_store(config: &ProgressConfig) -> Result<Arc<dyn ProgressStore>> {
    Ok(match config.backend {
        ProgressBackend::File => Arc::new(FileProgressStore::open(&config.path)?),
        ProgressBackend::Sqlite => Arc::new(SqliteProgressStore::open(&config.path).await?),
    })
}

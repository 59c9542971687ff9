//! SQLite backend for the progress store.
//!
//! One row per committed file in `progress(identity, committed_at)`. Each
//! commit is a single `INSERT OR IGNORE`, so a record is either fully present
//! or absent after a crash.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use super::ProgressStore;
use crate::models::FileIdentity;

pub struct SqliteProgressStore {
    pool: SqlitePool,
}

impl SqliteProgressStore {
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Single writer; one connection keeps commits strictly ordered.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS progress (
                identity TEXT PRIMARY KEY,
                committed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    fn backend(&self) -> &str {
        "sqlite"
    }

    async fn is_processed(&self, identity: &FileIdentity) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM progress WHERE identity = ?")
            .bind(identity.key())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn commit(&self, identity: &FileIdentity) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT OR IGNORE INTO progress (identity, committed_at) VALUES (?, ?)")
            .bind(identity.key())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        sqlx::query("DELETE FROM progress")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM progress")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

//! In-memory [`ProgressStore`] for tests.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ProgressStore;
use crate::models::FileIdentity;

#[derive(Default)]
pub struct InMemoryProgressStore {
    records: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed identity keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .records
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn is_processed(&self, identity: &FileIdentity) -> Result<bool> {
        let records = self.records.read().map_err(|_| anyhow!("lock poisoned"))?;
        Ok(records.contains_key(&identity.key()))
    }

    async fn commit(&self, identity: &FileIdentity) -> Result<()> {
        let mut records = self.records.write().map_err(|_| anyhow!("lock poisoned"))?;
        records.entry(identity.key()).or_insert_with(Utc::now);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.records
            .write()
            .map_err(|_| anyhow!("lock poisoned"))?
            .clear();
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let records = self.records.read().map_err(|_| anyhow!("lock poisoned"))?;
        Ok(records.len() as u64)
    }
}

//! In-memory [`Sink`] for tests and dry runs.
//!
//! Keeps the latest body per `(partition, id)`, which is exactly the upsert
//! semantics of the real index, and counts upload calls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use super::{BulkOperation, PerDocumentResult, Sink, SinkError};

#[derive(Default)]
pub struct InMemorySink {
    docs: RwLock<BTreeMap<(String, String), Value>>,
    calls: AtomicUsize,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `upload` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of distinct documents stored.
    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.docs
            .read()
            .ok()
            .and_then(|d| d.get(&(index.to_string(), id.to_string())).cloned())
    }

    /// Stored `(partition, id)` pairs, sorted.
    pub fn keys(&self) -> Vec<(String, String)> {
        self.docs
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sink for InMemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(&self, operations: &[BulkOperation]) -> Result<Vec<PerDocumentResult>, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut docs = self
            .docs
            .write()
            .map_err(|_| SinkError::Unavailable("in-memory sink lock poisoned".into()))?;
        Ok(operations
            .iter()
            .map(|op| {
                docs.insert((op.index.clone(), op.id.clone()), op.document.clone());
                PerDocumentResult::Committed
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

//! Sink abstraction: where documents end up.
//!
//! A [`Sink`] accepts a bulk of [`BulkOperation`]s and reports one
//! [`PerDocumentResult`] per operation, in request order. Writes are
//! upserts keyed by `document_id`, so resubmitting a whole batch after a
//! partial failure overwrites instead of duplicating.
//!
//! Errors that say nothing about individual documents (connection refused,
//! authentication failure, timeouts) are [`SinkError::Unavailable`] and abort
//! the cycle; per-document refusals are [`PerDocumentResult::Rejected`] and
//! only affect that document.

pub mod elasticsearch;
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::ConversationDocument;

pub use elasticsearch::ElasticsearchSink;
pub use memory::InMemorySink;

/// One upsert: `{index: <partition>, id: <document_id>, document}`.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOperation {
    pub index: String,
    pub id: String,
    pub document: serde_json::Value,
}

impl BulkOperation {
    /// Route a document to its monthly partition under `index_prefix`.
    pub fn upsert(document: &ConversationDocument, index_prefix: &str) -> Result<Self, SinkError> {
        Ok(Self {
            index: document.partition(index_prefix),
            id: document.document_id.clone(),
            document: serde_json::to_value(document)
                .map_err(|e| SinkError::Protocol(format!("document not serializable: {}", e)))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerDocumentResult {
    Committed,
    Rejected { reason: String },
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// Connectivity, authentication, or deadline failure. Aborts the cycle.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// The sink answered, but not in a way that maps to per-document results.
    #[error("sink protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Short label for logs and status output.
    fn name(&self) -> &str;

    /// Upsert every operation; one result per operation, in the same order.
    async fn upload(&self, operations: &[BulkOperation]) -> Result<Vec<PerDocumentResult>, SinkError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), SinkError>;
}

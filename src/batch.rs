//! Batch composition.
//!
//! [`stage_batches`] is the producer half of a cycle: it reads and parses
//! the discovered captures on the blocking pool (up to `parse_workers` at a
//! time, results kept in discovery order), groups successfully parsed
//! documents into [`Batch`]es of at most `max_batch_size`, and hands them to
//! the coordinator over a bounded channel. The channel holds one batch, so
//! parsing overlaps the upload of the batch in flight while staying a bounded
//! distance ahead of it. Staging stops as soon as the coordinator drops its
//! receiver.

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::capture::{parse_capture, ParseFailure};
use crate::models::{Batch, ConversationDocument, FileIdentity, PendingDocument, RawCapture};

/// Accumulates pending documents into bounded batches, preserving order.
#[derive(Debug)]
pub struct Batcher {
    max_batch_size: usize,
    pending: Vec<PendingDocument>,
    next_seq: usize,
}

impl Batcher {
    pub fn new(max_batch_size: usize) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Self {
            max_batch_size,
            pending: Vec::with_capacity(max_batch_size),
            next_seq: 1,
        }
    }

    /// Add a document; returns a batch once `max_batch_size` is reached.
    pub fn push(&mut self, item: PendingDocument) -> Option<Batch> {
        self.pending.push(item);
        if self.pending.len() >= self.max_batch_size {
            Some(self.take())
        } else {
            None
        }
    }

    /// Flush whatever is left as a final, possibly short, batch.
    pub fn finish(mut self) -> Option<Batch> {
        (!self.pending.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> Batch {
        let items = std::mem::replace(&mut self.pending, Vec::with_capacity(self.max_batch_size));
        let seq = self.next_seq;
        self.next_seq += 1;
        Batch { seq, items }
    }
}

#[derive(Debug, Clone)]
pub struct StageOptions {
    pub max_batch_size: usize,
    pub parse_workers: usize,
    pub user_segment: usize,
}

/// What the producer saw, reported once staging ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub parsed: u64,
    pub failed: u64,
}

/// Read and parse one capture file.
pub fn load_and_parse(
    identity: FileIdentity,
    user_segment: usize,
) -> (FileIdentity, Result<ConversationDocument, ParseFailure>) {
    match RawCapture::load(identity.clone(), user_segment) {
        Ok(raw) => {
            let parsed = parse_capture(&raw);
            (raw.identity, parsed)
        }
        Err(e) => (
            identity,
            Err(ParseFailure::malformed(format!("unreadable capture: {}", e))),
        ),
    }
}

/// Parse `files` and send full batches to `tx` in discovery order.
pub async fn stage_batches(
    files: Vec<FileIdentity>,
    options: StageOptions,
    tx: mpsc::Sender<Batch>,
) -> StageStats {
    let mut stats = StageStats::default();
    let mut batcher = Batcher::new(options.max_batch_size);
    let user_segment = options.user_segment;

    let mut parsed = stream::iter(files)
        .map(|identity| tokio::task::spawn_blocking(move || load_and_parse(identity, user_segment)))
        .buffered(options.parse_workers.max(1));

    while let Some(joined) = parsed.next().await {
        if tx.is_closed() {
            return stats;
        }
        let (identity, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "parse task failed");
                stats.failed += 1;
                continue;
            }
        };

        match result {
            Ok(document) => {
                stats.parsed += 1;
                if let Some(batch) = batcher.push(PendingDocument { document, identity }) {
                    if tx.send(batch).await.is_err() {
                        return stats;
                    }
                }
            }
            Err(failure) => {
                stats.failed += 1;
                tracing::warn!(
                    file = %identity.path.display(),
                    kind = ?failure.kind,
                    detail = %failure.detail,
                    "capture not shipped; will retry next cycle"
                );
            }
        }
    }

    if let Some(batch) = batcher.finish() {
        let _ = tx.send(batch).await;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn pending(name: &str) -> PendingDocument {
        let identity = FileIdentity {
            path: PathBuf::from("/c/u").join(name),
            relative_path: format!("u/{}", name),
            size: 1,
            modified: Utc.timestamp_opt(0, 0).unwrap(),
        };
        PendingDocument {
            document: ConversationDocument {
                document_id: name.to_string(),
                timestamp: Utc.timestamp_opt(0, 0).unwrap(),
                user_id: "u".into(),
                file_name: name.into(),
                conversation: vec![],
                metadata: BTreeMap::new(),
            },
            identity,
        }
    }

    fn names(batch: &Batch) -> Vec<String> {
        batch.items.iter().map(|p| p.document.file_name.clone()).collect()
    }

    #[test]
    fn batches_are_bounded_and_ordered() {
        let mut batcher = Batcher::new(2);
        assert!(batcher.push(pending("a.json")).is_none());
        let first = batcher.push(pending("b.json")).unwrap();
        assert!(batcher.push(pending("c.json")).is_none());
        let last = batcher.finish().unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(names(&first), vec!["a.json", "b.json"]);
        assert_eq!(last.seq, 2);
        assert_eq!(names(&last), vec!["c.json"]);
    }

    #[test]
    fn empty_batcher_flushes_nothing() {
        assert!(Batcher::new(10).finish().is_none());
    }
}

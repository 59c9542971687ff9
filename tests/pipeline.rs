use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use transcript_shipper::config::SourceConfig;
use transcript_shipper::discovery::Discovery;
use transcript_shipper::models::FileIdentity;
use transcript_shipper::pipeline::{CycleError, CycleState, CycleSummary, Pipeline, PipelineSettings};
use transcript_shipper::sink::{BulkOperation, InMemorySink, PerDocumentResult, Sink, SinkError};
use transcript_shipper::store::{FileProgressStore, InMemoryProgressStore, ProgressStore};

// ─── Fixtures ───────────────────────────────────────────────────────

fn write_capture(root: &Path, rel: &str) {
    let body = json!({
        "timestamp": "2025-04-02T10:15:00Z",
        "proxy-time-consumed": "1.2s",
        "request": {"content": {
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": format!("question from {}", rel)}]
        }},
        "response": {"content": {"choices": [{"message": {"content": "an answer"}}]}}
    });
    write_raw(root, rel, &serde_json::to_vec(&body).unwrap());
}

fn write_raw(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn discovery(root: &Path) -> Discovery {
    Discovery::from_config(&SourceConfig {
        root: root.to_path_buf(),
        include_globs: vec!["**/*.json".to_string()],
        exclude_globs: vec![],
        follow_symlinks: false,
        user_segment: 0,
    })
    .unwrap()
}

fn settings(max_batch_size: usize) -> PipelineSettings {
    PipelineSettings {
        max_batch_size,
        max_files_per_cycle: None,
        parse_workers: 2,
        user_segment: 0,
        index_prefix: "logs".to_string(),
        upload_deadline: Duration::from_secs(5),
    }
}

fn pipeline(
    root: &Path,
    store: Arc<dyn ProgressStore>,
    sink: Arc<dyn Sink>,
    max_batch_size: usize,
) -> Pipeline {
    Pipeline::new(discovery(root), store, sink, settings(max_batch_size))
}

/// Relative paths of every capture the store reports as committed.
async fn committed(root: &Path, store: &dyn ProgressStore) -> Vec<String> {
    let all: Vec<FileIdentity> = discovery(root).walk().unwrap().collect();
    let mut out = Vec::new();
    for identity in all {
        if store.is_processed(&identity).await.unwrap() {
            out.push(identity.relative_path);
        }
    }
    out
}

fn summary(discovered: u64, committed: u64, failed: u64) -> CycleSummary {
    CycleSummary {
        files_discovered: discovered,
        documents_committed: committed,
        files_failed: failed,
        documents_rejected: 0,
    }
}

// ─── Test sinks and stores ──────────────────────────────────────────

/// Records the file names of every upload call, then delegates.
#[derive(Default)]
struct RecordingSink {
    inner: InMemorySink,
    uploads: Mutex<Vec<Vec<String>>>,
}

impl RecordingSink {
    fn uploads(&self) -> Vec<Vec<String>> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn upload(&self, ops: &[BulkOperation]) -> Result<Vec<PerDocumentResult>, SinkError> {
        let names = ops
            .iter()
            .map(|op| op.document["file_name"].as_str().unwrap_or_default().to_string())
            .collect();
        self.uploads.lock().unwrap().push(names);
        self.inner.upload(ops).await
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Fails every upload from call `fail_from` (1-based) onwards.
struct FailingSink {
    inner: InMemorySink,
    fail_from: usize,
    calls: AtomicUsize,
}

impl FailingSink {
    fn new(fail_from: usize) -> Self {
        Self {
            inner: InMemorySink::new(),
            fail_from,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn upload(&self, ops: &[BulkOperation]) -> Result<Vec<PerDocumentResult>, SinkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call >= self.fail_from {
            return Err(SinkError::Unavailable("connection refused".into()));
        }
        self.inner.upload(ops).await
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Rejects documents whose file name contains "bad".
#[derive(Default)]
struct RejectingSink {
    inner: InMemorySink,
}

#[async_trait]
impl Sink for RejectingSink {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn upload(&self, ops: &[BulkOperation]) -> Result<Vec<PerDocumentResult>, SinkError> {
        let mut results = Vec::new();
        for op in ops {
            let name = op.document["file_name"].as_str().unwrap_or_default();
            if name.contains("bad") {
                results.push(PerDocumentResult::Rejected {
                    reason: "mapper_parsing_exception".into(),
                });
            } else {
                results.extend(self.inner.upload(std::slice::from_ref(op)).await?);
            }
        }
        Ok(results)
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Refuses the whole first batch with a 413, then accepts.
#[derive(Default)]
struct OversizeOnceSink {
    inner: InMemorySink,
    calls: AtomicUsize,
}

#[async_trait]
impl Sink for OversizeOnceSink {
    fn name(&self) -> &str {
        "oversize-once"
    }

    async fn upload(&self, ops: &[BulkOperation]) -> Result<Vec<PerDocumentResult>, SinkError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(SinkError::Protocol("bulk request rejected: 413 Payload Too Large".into()));
        }
        self.inner.upload(ops).await
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sleeps before every upload.
struct SlowSink {
    inner: InMemorySink,
    delay: Duration,
}

#[async_trait]
impl Sink for SlowSink {
    fn name(&self) -> &str {
        "slow"
    }

    async fn upload(&self, ops: &[BulkOperation]) -> Result<Vec<PerDocumentResult>, SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upload(ops).await
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Acknowledges the upload, then fails the first commit as a crash would.
struct CrashingStore<S> {
    inner: S,
    crashed: AtomicBool,
}

#[async_trait]
impl<S: ProgressStore> ProgressStore for CrashingStore<S> {
    fn backend(&self) -> &str {
        "crashing"
    }

    async fn is_processed(&self, identity: &FileIdentity) -> Result<bool> {
        self.inner.is_processed(identity).await
    }

    async fn commit(&self, identity: &FileIdentity) -> Result<()> {
        if !self.crashed.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.inner.commit(identity).await
    }

    async fn reset(&self) -> Result<()> {
        self.inner.reset().await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn valid_and_truncated_capture_summary_repeats() {
    let tmp = TempDir::new().unwrap();
    write_capture(tmp.path(), "user1/s1.json");
    write_raw(tmp.path(), "user1/s2.json", br#"{"timestamp": "2025-04-02T10:15:00Z", "requ"#);

    let store = Arc::new(InMemoryProgressStore::new());
    let sink = Arc::new(InMemorySink::new());
    let p = pipeline(tmp.path(), store.clone(), sink.clone(), 10);

    let first = p.run_cycle().await.unwrap().unwrap();
    assert_eq!(first, summary(2, 1, 1));
    assert_eq!(committed(tmp.path(), store.as_ref()).await, vec!["user1/s1.json"]);

    let doc = &sink.keys()[0];
    assert_eq!(doc.0, "logs-2025-04");
    let stored = sink.get(&doc.0, &doc.1).unwrap();
    assert_eq!(stored["user_id"], "user1");
    assert_eq!(stored["conversation"].as_array().unwrap().len(), 2);

    // s1 is no longer pending; s2 is retried and fails the same way.
    let second = p.run_cycle().await.unwrap().unwrap();
    assert_eq!(second, summary(1, 0, 1));
    assert_eq!(committed(tmp.path(), store.as_ref()).await, vec!["user1/s1.json"]);
    assert_eq!(sink.calls(), 1);
}

#[tokio::test]
async fn nothing_new_means_no_sink_calls() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("user1")).unwrap();

    let sink = Arc::new(InMemorySink::new());
    let p = pipeline(tmp.path(), Arc::new(InMemoryProgressStore::new()), sink.clone(), 10);

    assert_eq!(p.run_cycle().await.unwrap(), Some(CycleSummary::default()));
    assert_eq!(sink.calls(), 0);
}

#[tokio::test]
async fn every_acknowledged_file_is_committed() {
    let tmp = TempDir::new().unwrap();
    for name in ["a", "b", "c", "d", "e"] {
        write_capture(tmp.path(), &format!("user1/{}.json", name));
    }
    let store = Arc::new(InMemoryProgressStore::new());
    let sink = Arc::new(InMemorySink::new());
    let p = pipeline(tmp.path(), store.clone(), sink.clone(), 2);

    let result = p.run_cycle().await.unwrap().unwrap();
    assert_eq!(result, summary(5, 5, 0));
    assert_eq!(sink.len(), 5);
    assert_eq!(sink.calls(), 3);
    assert_eq!(committed(tmp.path(), store.as_ref()).await.len(), 5);
    assert_eq!(p.state(), CycleState::Idle);

    assert_eq!(p.run_cycle().await.unwrap(), Some(CycleSummary::default()));
    assert_eq!(sink.calls(), 3);
}

#[tokio::test]
async fn batches_preserve_path_order() {
    let tmp = TempDir::new().unwrap();
    for name in ["c", "a", "b"] {
        write_capture(tmp.path(), &format!("user1/{}.json", name));
    }
    let sink = Arc::new(RecordingSink::default());
    let p = pipeline(tmp.path(), Arc::new(InMemoryProgressStore::new()), sink.clone(), 2);

    p.run_cycle().await.unwrap();
    assert_eq!(
        sink.uploads(),
        vec![
            vec!["a.json".to_string(), "b.json".to_string()],
            vec!["c.json".to_string()]
        ]
    );
}

#[tokio::test]
async fn sink_outage_keeps_earlier_batches_only() {
    let tmp = TempDir::new().unwrap();
    for name in ["a", "b", "c", "d", "e", "f"] {
        write_capture(tmp.path(), &format!("user1/{}.json", name));
    }
    let store: Arc<dyn ProgressStore> = Arc::new(InMemoryProgressStore::new());

    let failing = pipeline(tmp.path(), store.clone(), Arc::new(FailingSink::new(2)), 2);
    let err = failing.run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::SinkUnavailable { .. }));
    assert_eq!(err.summary().documents_committed, 2);
    assert_eq!(failing.state(), CycleState::Idle);
    assert_eq!(
        committed(tmp.path(), store.as_ref()).await,
        vec!["user1/a.json", "user1/b.json"]
    );

    let sink = Arc::new(RecordingSink::default());
    let healthy = pipeline(tmp.path(), store.clone(), sink.clone(), 2);
    let result = healthy.run_cycle().await.unwrap().unwrap();
    assert_eq!(result, summary(4, 4, 0));
    assert_eq!(
        sink.uploads(),
        vec![
            vec!["c.json".to_string(), "d.json".to_string()],
            vec!["e.json".to_string(), "f.json".to_string()]
        ]
    );
}

#[tokio::test]
async fn commit_lost_after_ack_is_redelivered_without_duplicate() {
    let tmp = TempDir::new().unwrap();
    write_capture(tmp.path(), "user1/s1.json");
    let progress_path = tmp.path().join("state/processed_files.log");
    let sink = Arc::new(InMemorySink::new());

    let crashing = Arc::new(CrashingStore {
        inner: FileProgressStore::open(&progress_path).unwrap(),
        crashed: AtomicBool::new(false),
    });
    let p = pipeline(tmp.path(), crashing, sink.clone(), 10);
    let err = p.run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::Store { .. }));
    assert_eq!(sink.len(), 1);

    // Restart: a fresh store over the same file.
    let store = Arc::new(FileProgressStore::open(&progress_path).unwrap());
    assert!(committed(tmp.path(), store.as_ref()).await.is_empty());

    let p = pipeline(tmp.path(), store.clone(), sink.clone(), 10);
    let result = p.run_cycle().await.unwrap().unwrap();
    assert_eq!(result, summary(1, 1, 0));
    assert_eq!(sink.calls(), 2);
    assert_eq!(sink.len(), 1);
    assert_eq!(committed(tmp.path(), store.as_ref()).await, vec!["user1/s1.json"]);
}

#[tokio::test]
async fn redelivery_overwrites_by_document_id() {
    let tmp = TempDir::new().unwrap();
    write_capture(tmp.path(), "user1/a.json");
    write_capture(tmp.path(), "user2/b.json");
    let store = Arc::new(InMemoryProgressStore::new());
    let sink = Arc::new(InMemorySink::new());
    let p = pipeline(tmp.path(), store.clone(), sink.clone(), 10);

    p.run_cycle().await.unwrap();
    let first_keys = sink.keys();
    store.reset().await.unwrap();
    p.run_cycle().await.unwrap();

    assert_eq!(sink.calls(), 2);
    assert_eq!(sink.keys(), first_keys);
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn rejected_document_is_left_for_next_cycle() {
    let tmp = TempDir::new().unwrap();
    write_capture(tmp.path(), "user1/bad.json");
    write_capture(tmp.path(), "user1/good.json");
    let store = Arc::new(InMemoryProgressStore::new());
    let p = pipeline(tmp.path(), store.clone(), Arc::new(RejectingSink::default()), 10);

    let result = p.run_cycle().await.unwrap().unwrap();
    assert_eq!(
        result,
        CycleSummary {
            files_discovered: 2,
            documents_committed: 1,
            files_failed: 1,
            documents_rejected: 1,
        }
    );
    assert_eq!(committed(tmp.path(), store.as_ref()).await, vec!["user1/good.json"]);
}

#[tokio::test]
async fn refused_batch_fails_its_files_and_later_batches_ship() {
    let tmp = TempDir::new().unwrap();
    write_capture(tmp.path(), "user1/a.json");
    write_capture(tmp.path(), "user1/b.json");
    let store = Arc::new(InMemoryProgressStore::new());
    let sink = Arc::new(OversizeOnceSink::default());
    let p = pipeline(tmp.path(), store.clone(), sink.clone(), 1);

    let result = p.run_cycle().await.unwrap().unwrap();
    assert_eq!(
        result,
        CycleSummary {
            files_discovered: 2,
            documents_committed: 1,
            files_failed: 1,
            documents_rejected: 1,
        }
    );
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    assert_eq!(committed(tmp.path(), store.as_ref()).await, vec!["user1/b.json"]);

    // The refused file is still pending and ships on the next cycle.
    let result = p.run_cycle().await.unwrap().unwrap();
    assert_eq!(result, summary(1, 1, 0));
    assert_eq!(
        committed(tmp.path(), store.as_ref()).await,
        vec!["user1/a.json", "user1/b.json"]
    );
}

#[tokio::test]
async fn overlapping_trigger_is_coalesced() {
    let tmp = TempDir::new().unwrap();
    write_capture(tmp.path(), "user1/a.json");
    let sink = Arc::new(SlowSink {
        inner: InMemorySink::new(),
        delay: Duration::from_millis(300),
    });
    let p = pipeline(tmp.path(), Arc::new(InMemoryProgressStore::new()), sink, 10);

    let (first, second) = tokio::join!(p.run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        p.run_cycle().await
    });

    assert_eq!(first.unwrap(), Some(summary(1, 1, 0)));
    assert_eq!(second.unwrap(), None);
    assert_eq!(p.state(), CycleState::Idle);
}

#[tokio::test]
async fn upload_past_deadline_aborts_cycle() {
    let tmp = TempDir::new().unwrap();
    write_capture(tmp.path(), "user1/a.json");
    let store = Arc::new(InMemoryProgressStore::new());
    let sink = Arc::new(SlowSink {
        inner: InMemorySink::new(),
        delay: Duration::from_secs(30),
    });
    let mut settings = settings(10);
    settings.upload_deadline = Duration::from_millis(100);
    let p = Pipeline::new(discovery(tmp.path()), store.clone(), sink, settings);

    match p.run_cycle().await {
        Err(CycleError::SinkUnavailable { cause, .. }) => {
            assert!(cause.to_string().contains("deadline"));
        }
        other => panic!("expected sink unavailable, got {:?}", other.map(|_| ())),
    }
    assert!(committed(tmp.path(), store.as_ref()).await.is_empty());
}

#[tokio::test]
async fn shutdown_stops_after_batch_in_flight() {
    let tmp = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
        write_capture(tmp.path(), &format!("user1/{}.json", name));
    }
    let store = Arc::new(InMemoryProgressStore::new());
    let sink = Arc::new(InMemorySink::new());
    let p = pipeline(tmp.path(), store.clone(), sink.clone(), 1);

    p.request_shutdown();
    let result = p.run_cycle().await.unwrap().unwrap();

    assert_eq!(result.documents_committed, 1);
    assert_eq!(sink.calls(), 1);
    assert_eq!(committed(tmp.path(), store.as_ref()).await, vec!["user1/a.json"]);
}

#[tokio::test]
async fn missing_root_is_a_discovery_abort() {
    let tmp = TempDir::new().unwrap();
    let p = pipeline(
        &tmp.path().join("absent"),
        Arc::new(InMemoryProgressStore::new()),
        Arc::new(InMemorySink::new()),
        10,
    );
    assert!(matches!(p.run_cycle().await, Err(CycleError::Discovery(_))));
}

#[tokio::test]
async fn max_files_per_cycle_caps_discovery() {
    let tmp = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
        write_capture(tmp.path(), &format!("user1/{}.json", name));
    }
    let mut settings = settings(10);
    settings.max_files_per_cycle = Some(2);
    let store = Arc::new(InMemoryProgressStore::new());
    let p = Pipeline::new(
        discovery(tmp.path()),
        store.clone(),
        Arc::new(InMemorySink::new()),
        settings,
    );

    assert_eq!(p.run_cycle().await.unwrap(), Some(summary(2, 2, 0)));
    assert_eq!(p.run_cycle().await.unwrap(), Some(summary(1, 1, 0)));
}

//! Pipeline coordinator.
//!
//! [`Pipeline::run_cycle`] is the one entry point every driver calls. A cycle
//! moves through `Idle → Scanning → Parsing → Uploading → Committing → Idle`:
//!
//! 1. **Scan** the source root for captures the progress store has not seen.
//! 2. **Parse** them on the blocking pool and group documents into batches
//!    (see [`crate::batch`]).
//! 3. **Upload** each batch to the sink as upserts keyed by `document_id`.
//! 4. **Commit** the identities of acknowledged documents, batch by batch,
//!    in discovery order.
//!
//! At most one cycle runs at a time. A trigger that arrives while a cycle is
//! active is coalesced and `run_cycle` returns `Ok(None)`.
//!
//! A sink that is unavailable (or an upload that overruns its deadline)
//! aborts the cycle before anything from the current batch is committed.
//! Batches committed earlier in the cycle stand. A sink that answers but
//! refuses a whole batch only fails that batch's files. A progress store that
//! cannot be written aborts the cycle immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::batch::{stage_batches, StageOptions};
use crate::config::Config;
use crate::discovery::Discovery;
use crate::models::Batch;
use crate::report::{CycleEvent, CycleReporter, NoReporter};
use crate::sink::{BulkOperation, ElasticsearchSink, PerDocumentResult, Sink, SinkError};
use crate::store::{open_store, ProgressStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Scanning,
    Parsing,
    Uploading,
    Committing,
    Failed,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub files_discovered: u64,
    pub documents_committed: u64,
    /// Parse failures plus rejected documents.
    pub files_failed: u64,
    /// The rejected share of `files_failed`.
    pub documents_rejected: u64,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("cycle aborted, sink unavailable: {cause}")]
    SinkUnavailable {
        summary: CycleSummary,
        #[source]
        cause: SinkError,
    },
    #[error("cycle aborted, progress store failed: {cause:#}")]
    Store {
        summary: CycleSummary,
        cause: anyhow::Error,
    },
    #[error("cycle aborted, discovery failed: {0:#}")]
    Discovery(anyhow::Error),
}

impl CycleError {
    /// Work that was durably done before the abort.
    pub fn summary(&self) -> CycleSummary {
        match self {
            CycleError::SinkUnavailable { summary, .. } | CycleError::Store { summary, .. } => {
                *summary
            }
            CycleError::Discovery(_) => CycleSummary::default(),
        }
    }
}

/// Knobs the coordinator needs, lifted out of [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_batch_size: usize,
    pub max_files_per_cycle: Option<usize>,
    pub parse_workers: usize,
    pub user_segment: usize,
    pub index_prefix: String,
    pub upload_deadline: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_batch_size: config.pipeline.max_batch_size,
            max_files_per_cycle: config.pipeline.max_files_per_cycle,
            parse_workers: config.pipeline.parse_workers,
            user_segment: config.source.user_segment,
            index_prefix: config.sink.index_prefix.clone(),
            upload_deadline: config.sink.upload_deadline(),
        }
    }
}

/// Why batch delivery stopped early.
enum Abort {
    Sink(SinkError),
    Store(anyhow::Error),
}

pub struct Pipeline {
    discovery: Discovery,
    store: Arc<dyn ProgressStore>,
    sink: Arc<dyn Sink>,
    settings: PipelineSettings,
    reporter: Box<dyn CycleReporter>,
    active: AtomicBool,
    state: Mutex<CycleState>,
    shutdown: watch::Sender<bool>,
}

/// Clears the single-flight flag when a cycle ends, however it ends.
struct ActiveCycle<'a> {
    pipeline: &'a Pipeline,
}

impl Drop for ActiveCycle<'_> {
    fn drop(&mut self) {
        self.pipeline.set_state(CycleState::Idle);
        self.pipeline.active.store(false, Ordering::SeqCst);
    }
}

impl Pipeline {
    pub fn new(
        discovery: Discovery,
        store: Arc<dyn ProgressStore>,
        sink: Arc<dyn Sink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            discovery,
            store,
            sink,
            settings,
            reporter: Box::new(NoReporter),
            active: AtomicBool::new(false),
            state: Mutex::new(CycleState::Idle),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Wire a pipeline to the configured source, store, and Elasticsearch.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let discovery = Discovery::from_config(&config.source)?;
        let store = open_store(&config.progress).await?;
        let sink: Arc<dyn Sink> = Arc::new(ElasticsearchSink::new(&config.sink)?);
        Ok(Self::new(
            discovery,
            store,
            sink,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn with_reporter(mut self, reporter: Box<dyn CycleReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn state(&self) -> CycleState {
        self.state.lock().map(|s| *s).unwrap_or(CycleState::Failed)
    }

    fn set_state(&self, next: CycleState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Ask the active cycle (and any driver loop) to stop after the batch in flight.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) has been called.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Run one ingestion cycle, or return `Ok(None)` if one is already running.
    pub async fn run_cycle(&self) -> Result<Option<CycleSummary>, CycleError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("cycle already running; trigger coalesced");
            return Ok(None);
        }
        let _active = ActiveCycle { pipeline: self };

        let result = self.cycle().await;
        match &result {
            Ok(summary) => {
                tracing::info!(
                    files_discovered = summary.files_discovered,
                    documents_committed = summary.documents_committed,
                    files_failed = summary.files_failed,
                    documents_rejected = summary.documents_rejected,
                    "cycle finished"
                );
                self.reporter.report(CycleEvent::Finished { summary: *summary });
            }
            Err(e) => {
                self.set_state(CycleState::Failed);
                tracing::error!(error = %e, "cycle aborted");
            }
        }
        result.map(Some)
    }

    async fn cycle(&self) -> Result<CycleSummary, CycleError> {
        self.set_state(CycleState::Scanning);
        let files = self
            .discovery
            .scan(self.store.as_ref(), self.settings.max_files_per_cycle)
            .await
            .map_err(CycleError::Discovery)?;

        let mut summary = CycleSummary {
            files_discovered: files.len() as u64,
            ..CycleSummary::default()
        };
        self.reporter.report(CycleEvent::Discovered {
            files: summary.files_discovered,
        });
        if files.is_empty() {
            return Ok(summary);
        }

        self.set_state(CycleState::Parsing);
        let options = StageOptions {
            max_batch_size: self.settings.max_batch_size,
            parse_workers: self.settings.parse_workers,
            user_segment: self.settings.user_segment,
        };
        let (tx, rx) = mpsc::channel(1);
        let (stats, delivered) = tokio::join!(
            stage_batches(files, options, tx),
            self.deliver(rx, &mut summary)
        );
        summary.files_failed += stats.failed;

        match delivered {
            Ok(()) => Ok(summary),
            Err(Abort::Sink(cause)) => Err(CycleError::SinkUnavailable { summary, cause }),
            Err(Abort::Store(cause)) => Err(CycleError::Store { summary, cause }),
        }
    }

    /// Upload and commit batches as staging produces them.
    ///
    /// Returning drops `rx`, which stops staging.
    async fn deliver(
        &self,
        mut rx: mpsc::Receiver<Batch>,
        summary: &mut CycleSummary,
    ) -> Result<(), Abort> {
        while let Some(batch) = rx.recv().await {
            self.set_state(CycleState::Uploading);
            let results = match self.upload(&batch).await {
                Ok(results) => results,
                // The sink answered but refused the whole batch; its files stay pending.
                Err(SinkError::Protocol(reason)) => {
                    tracing::warn!(batch = batch.seq, documents = batch.len(), reason = %reason, "batch refused by sink");
                    vec![PerDocumentResult::Rejected { reason }; batch.len()]
                }
                Err(e) => {
                    tracing::error!(batch = batch.seq, documents = batch.len(), error = %e, "batch upload failed");
                    return Err(Abort::Sink(e));
                }
            };

            self.set_state(CycleState::Committing);
            let mut committed = 0u64;
            let mut rejected = 0u64;
            for (item, result) in batch.items.iter().zip(results) {
                match result {
                    PerDocumentResult::Committed => {
                        self.store
                            .commit(&item.identity)
                            .await
                            .map_err(|e| {
                                tracing::error!(file = %item.identity, error = %e, "progress commit failed");
                                Abort::Store(e)
                            })?;
                        committed += 1;
                        summary.documents_committed += 1;
                    }
                    PerDocumentResult::Rejected { reason } => {
                        rejected += 1;
                        summary.documents_rejected += 1;
                        summary.files_failed += 1;
                        tracing::warn!(
                            file = %item.identity,
                            document_id = %item.document.document_id,
                            reason = %reason,
                            "document rejected by sink; will retry next cycle"
                        );
                    }
                }
            }

            tracing::debug!(batch = batch.seq, committed, rejected, "batch committed");
            self.reporter.report(CycleEvent::BatchUploaded {
                batch: batch.seq,
                committed,
                rejected,
            });

            if self.shutdown_requested() {
                tracing::info!(batch = batch.seq, "shutdown requested; stopping after this batch");
                return Ok(());
            }
            self.set_state(CycleState::Parsing);
        }
        Ok(())
    }

    async fn upload(&self, batch: &Batch) -> Result<Vec<PerDocumentResult>, SinkError> {
        let operations = batch
            .items
            .iter()
            .map(|item| BulkOperation::upsert(&item.document, &self.settings.index_prefix))
            .collect::<Result<Vec<_>, _>>()?;

        let results = tokio::time::timeout(self.settings.upload_deadline, self.sink.upload(&operations))
            .await
            .map_err(|_| {
                SinkError::Unavailable(format!(
                    "upload exceeded deadline of {}s",
                    self.settings.upload_deadline.as_secs_f64()
                ))
            })??;

        if results.len() != operations.len() {
            return Err(SinkError::Protocol(format!(
                "{} results for {} documents",
                results.len(),
                operations.len()
            )));
        }
        Ok(results)
    }
}

//! Cycle progress reporting.
//!
//! Progress is emitted on **stderr** so stdout stays parseable for scripts
//! that read the cycle summary.

use std::io::Write;

use crate::pipeline::CycleSummary;

/// A single progress event for a cycle.
#[derive(Clone, Debug)]
pub enum CycleEvent {
    /// Discovery finished; `files` captures are pending.
    Discovered { files: u64 },
    /// Batch `batch` came back from the sink and was committed.
    BatchUploaded {
        batch: usize,
        committed: u64,
        rejected: u64,
    },
    Finished { summary: CycleSummary },
}

pub trait CycleReporter: Send + Sync {
    fn report(&self, event: CycleEvent);
}

/// Human-friendly progress on stderr: "cycle  batch 3  committed 100  rejected 0".
pub struct StderrReporter;

impl CycleReporter for StderrReporter {
    fn report(&self, event: CycleEvent) {
        let line = match &event {
            CycleEvent::Discovered { files } => {
                format!("cycle  discovered {} pending captures\n", format_number(*files))
            }
            CycleEvent::BatchUploaded {
                batch,
                committed,
                rejected,
            } => format!(
                "cycle  batch {}  committed {}  rejected {}\n",
                batch,
                format_number(*committed),
                format_number(*rejected)
            ),
            CycleEvent::Finished { summary } => format!(
                "cycle  done  {} discovered, {} committed, {} failed\n",
                format_number(summary.files_discovered),
                format_number(summary.documents_committed),
                format_number(summary.files_failed)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonReporter;

impl CycleReporter for JsonReporter {
    fn report(&self, event: CycleEvent) {
        let obj = match &event {
            CycleEvent::Discovered { files } => serde_json::json!({
                "event": "discovered",
                "files": files
            }),
            CycleEvent::BatchUploaded {
                batch,
                committed,
                rejected,
            } => serde_json::json!({
                "event": "batch",
                "batch": batch,
                "committed": committed,
                "rejected": rejected
            }),
            CycleEvent::Finished { summary } => serde_json::json!({
                "event": "finished",
                "summary": summary
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoReporter;

impl CycleReporter for NoReporter {
    fn report(&self, _event: CycleEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// `--progress` values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    Auto,
    Human,
    Json,
    Off,
}

impl ProgressMode {
    pub fn resolve(self) -> Self {
        match self {
            ProgressMode::Auto if atty::is(atty::Stream::Stderr) => ProgressMode::Human,
            ProgressMode::Auto => ProgressMode::Off,
            other => other,
        }
    }

    pub fn reporter(self) -> Box<dyn CycleReporter> {
        match self.resolve() {
            ProgressMode::Human => Box::new(StderrReporter),
            ProgressMode::Json => Box::new(JsonReporter),
            ProgressMode::Auto | ProgressMode::Off => Box::new(NoReporter),
        }
    }
}

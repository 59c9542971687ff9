//! Append-only text file backend.
//!
//! Layout: one line per committed file, `"{identity}\t{committed_at}\n"`.
//! A line without a tab is read as a bare identity. Each commit is a single
//! `write_all` of the full line followed by `sync_data`, cut back to the
//! previous end if either fails. On open, a trailing partial line (a commit
//! torn by a crash) is discarded and truncated away, so an interrupted commit
//! reads as "not processed".

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ProgressRecord, ProgressStore};
use crate::models::FileIdentity;

pub struct FileProgressStore {
    path: PathBuf,
    state: Mutex<State>,
}

struct State {
    file: File,
    processed: HashSet<String>,
}

impl FileProgressStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("Failed to open progress store: {}", path.display()))?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let complete_len = match content.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        if complete_len < content.len() {
            tracing::warn!(
                store = %path.display(),
                bytes = content.len() - complete_len,
                "discarding torn trailing progress record"
            );
            file.set_len(complete_len as u64)?;
            file.sync_data()?;
        }

        let processed = String::from_utf8_lossy(&content[..complete_len])
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| parse_line(l).identity)
            .collect::<HashSet<_>>();

        tracing::debug!(store = %path.display(), records = processed.len(), "progress store opened");

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(State { file, processed }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("progress store lock poisoned"))
    }
}

fn parse_line(line: &str) -> ProgressRecord {
    if let Some((identity, ts)) = line.rsplit_once('\t') {
        if let Ok(committed_at) = DateTime::parse_from_rfc3339(ts) {
            return ProgressRecord {
                identity: identity.to_string(),
                committed_at: committed_at.with_timezone(&Utc),
            };
        }
    }
    ProgressRecord {
        identity: line.to_string(),
        committed_at: DateTime::<Utc>::from(std::time::SystemTime::UNIX_EPOCH),
    }
}

/// Where progress records are appended.
trait RecordLog: Write {
    fn end(&mut self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl RecordLog for File {
    fn end(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Append one record whole or not at all. A failed write is cut back to the
/// previous end so the next record does not land on a fragment.
fn append_record<L: RecordLog>(log: &mut L, line: &[u8]) -> io::Result<()> {
    let end = log.end()?;
    match log.write_all(line).and_then(|_| log.sync()) {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(rollback) = log.truncate_to(end) {
                tracing::error!(error = %rollback, "could not roll back partial progress record");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    fn backend(&self) -> &str {
        "file"
    }

    async fn is_processed(&self, identity: &FileIdentity) -> Result<bool> {
        Ok(self.lock()?.processed.contains(&identity.key()))
    }

    async fn commit(&self, identity: &FileIdentity) -> Result<()> {
        let key = identity.key();
        let mut state = self.lock()?;
        if state.processed.contains(&key) {
            return Ok(());
        }

        let line = format!("{}\t{}\n", key, Utc::now().to_rfc3339());
        append_record(&mut state.file, line.as_bytes())
            .with_context(|| format!("Failed to append to progress store: {}", self.path.display()))?;
        state.processed.insert(key);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.file.set_len(0)?;
        state.file.sync_data()?;
        state.processed.clear();
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.lock()?.processed.len() as u64)
    }
}

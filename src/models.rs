//! Core data models used throughout the shipper.
//!
//! These types represent the captures, documents, and batches that flow
//! through the ingestion pipeline: file identities come out of discovery,
//! raw captures are read from disk, the parser turns them into
//! [`ConversationDocument`]s, and batches of [`PendingDocument`]s are handed
//! to the sink.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one source file: where it lives and which version of it we saw.
///
/// Two identities with the same path but different modification times are
/// different logical files; the progress store keys on [`FileIdentity::key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    /// Absolute path of the capture file.
    pub path: PathBuf,
    /// Path relative to the configured source root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileIdentity {
    /// Build an identity from filesystem metadata.
    pub fn from_path(root: &Path, path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let relative = path.strip_prefix(root).unwrap_or(path);
        let relative_path = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            path: path.to_path_buf(),
            relative_path,
            size: metadata.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }

    /// Stable key recorded in the progress store: `"{path}@{secs}.{nanos}"`.
    pub fn key(&self) -> String {
        format!(
            "{}@{}.{:09}",
            self.path.display(),
            self.modified.timestamp(),
            self.modified.timestamp_subsec_nanos()
        )
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// The directory segment at `index` of the relative path, if there is one.
    ///
    /// The file name itself is never a user segment: `user1/s1.json` has one
    /// directory segment (`user1`), `s1.json` has none.
    pub fn user_segment(&self, index: usize) -> Option<String> {
        let mut parts: Vec<&str> = self.relative_path.split('/').collect();
        parts.pop();
        parts
            .get(index)
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Bytes of one capture file plus the identity they were read from.
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub identity: FileIdentity,
    /// User identity taken from the file's directory path, if it has one.
    pub user_id: Option<String>,
    pub bytes: Vec<u8>,
}

impl RawCapture {
    /// Read a capture from disk. `user_segment` selects which directory of
    /// the relative path encodes the user.
    pub fn load(identity: FileIdentity, user_segment: usize) -> std::io::Result<Self> {
        let bytes = std::fs::read(&identity.path)?;
        let user_id = identity.user_segment(user_segment);
        Ok(Self {
            identity,
            user_id,
            bytes,
        })
    }
}

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Map a wire role name; roles other than user/assistant are not turns.
    pub fn from_wire(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One turn of a conversation, in capture order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Normalized document shipped to the sink.
///
/// `document_id` is not part of the indexed body; it travels as the bulk
/// operation's `_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDocument {
    #[serde(skip)]
    pub document_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub file_name: String,
    pub conversation: Vec<Turn>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ConversationDocument {
    /// Sink partition for this document: `{prefix}-{YYYY-MM}` of its timestamp.
    pub fn partition(&self, index_prefix: &str) -> String {
        format!("{}-{}", index_prefix, self.timestamp.format("%Y-%m"))
    }
}

/// A parsed document waiting for delivery, paired with the file it came from.
#[derive(Debug, Clone)]
pub struct PendingDocument {
    pub document: ConversationDocument,
    pub identity: FileIdentity,
}

/// Bounded, ordered group of pending documents delivered in one sink call.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position of this batch within its cycle, starting at 1.
    pub seq: usize,
    pub items: Vec<PendingDocument>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

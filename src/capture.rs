//! Capture parser.
//!
//! Turns the bytes of one intercepted chat session into a
//! [`ConversationDocument`]. Input is untrusted: anything that is not a
//! UTF-8 JSON object comes back as [`ParseFailureKind::Malformed`], and a
//! capture missing a mandatory field (timestamp, user, file name, at least one
//! conversation turn) comes back as [`ParseFailureKind::IncompleteCapture`].
//! Parsing never touches the progress store or the sink.
//!
//! # Capture layout
//!
//! ```text
//! { "timestamp": "...", "proxy-time-consumed": "...",
//!   "request":  { "headers": {...}, "content": <object | JSON string> },
//!   "response": { "content": <object | chunk array | JSON string | SSE | text> } }
//! ```
//!
//! File names written by the proxy carry extra metadata:
//! `2025-03-26T06-16-09.008386_<machine>_<ip>_<editor>_<panel>.json`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{ConversationDocument, FileIdentity, RawCapture, Role, Turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailureKind {
    /// Not UTF-8, not JSON, or not a JSON object.
    Malformed,
    /// Well-formed, but a mandatory field is missing.
    IncompleteCapture,
}

/// Why a capture could not become a document. File-local; never fatal to a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {detail}")]
pub struct ParseFailure {
    pub kind: ParseFailureKind,
    pub detail: String,
}

impl ParseFailure {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: ParseFailureKind::Malformed,
            detail: detail.into(),
        }
    }

    pub fn incomplete(detail: impl Into<String>) -> Self {
        Self {
            kind: ParseFailureKind::IncompleteCapture,
            detail: detail.into(),
        }
    }
}

/// Parse one capture.
pub fn parse_capture(raw: &RawCapture) -> Result<ConversationDocument, ParseFailure> {
    let text = std::str::from_utf8(&raw.bytes)
        .map_err(|e| ParseFailure::malformed(format!("invalid UTF-8: {}", e)))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ParseFailure::malformed(format!("invalid JSON: {}", e)))?;
    let envelope = value
        .as_object()
        .ok_or_else(|| ParseFailure::malformed("capture is not a JSON object"))?;

    let file_name = raw.identity.file_name();
    if file_name.is_empty() {
        return Err(ParseFailure::incomplete("capture has no file name"));
    }

    let user_id = raw
        .user_id
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ParseFailure::incomplete("path has no user directory segment"))?;

    let timestamp = envelope
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .or_else(|| FileNameParts::parse(&file_name).map(|p| p.timestamp))
        .ok_or_else(|| ParseFailure::incomplete("no capture timestamp"))?;

    let conversation = extract_conversation(envelope);
    if conversation.is_empty() {
        return Err(ParseFailure::incomplete("no conversation turns"));
    }

    let metadata = extract_metadata(envelope, &file_name);

    Ok(ConversationDocument {
        document_id: document_id(&raw.identity),
        timestamp,
        user_id,
        file_name,
        conversation,
        metadata,
    })
}

/// Deterministic document id: hex SHA-256 over the path and modification time.
///
/// Re-parsing an unmodified file yields the same id, which is what makes
/// redelivery an overwrite at the sink instead of a duplicate.
pub fn document_id(identity: &FileIdentity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.path.to_string_lossy().as_bytes());
    hasher.update(identity.modified.timestamp().to_le_bytes());
    hasher.update(identity.modified.timestamp_subsec_nanos().to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Accepts RFC 3339, or a naive ISO-8601 date-time which is taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Metadata encoded in a proxy-written file name.
#[derive(Debug, Clone, PartialEq)]
struct FileNameParts {
    timestamp: DateTime<Utc>,
    machine_id: Option<String>,
    ip_address: Option<String>,
    editor_version: Option<String>,
}

impl FileNameParts {
    /// Only names whose first segment is a timestamp follow the proxy pattern;
    /// for anything else no segment is trusted.
    fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".json").unwrap_or(file_name);
        let parts: Vec<&str> = stem.split('_').collect();
        let timestamp = NaiveDateTime::parse_from_str(parts[0], "%Y-%m-%dT%H-%M-%S%.f")
            .ok()?
            .and_utc();
        let segment = |i: usize| {
            parts
                .get(i)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            timestamp,
            machine_id: segment(1),
            ip_address: segment(2).filter(|ip| ip.parse::<IpAddr>().is_ok()),
            editor_version: segment(3),
        })
    }
}

/// Request/response `content` may be an object or a JSON document in a string.
fn decode_embedded(value: &Value) -> Option<Cow<'_, Value>> {
    match value {
        Value::String(s) => serde_json::from_str::<Value>(s).ok().map(Cow::Owned),
        Value::Null => None,
        other => Some(Cow::Borrowed(other)),
    }
}

fn request_content(envelope: &Map<String, Value>) -> Option<Cow<'_, Value>> {
    envelope
        .get("request")
        .and_then(|r| r.get("content"))
        .and_then(decode_embedded)
}

fn extract_conversation(envelope: &Map<String, Value>) -> Vec<Turn> {
    let mut conversation = Vec::new();

    if let Some(content) = request_content(envelope) {
        if let Some(messages) = content.get("messages").and_then(Value::as_array) {
            for msg in messages {
                let Some(role) = msg.get("role").and_then(Value::as_str).and_then(Role::from_wire)
                else {
                    continue;
                };
                let Some(text) = msg.get("content").and_then(message_text) else {
                    continue;
                };
                conversation.push(Turn {
                    role,
                    content: text,
                    timestamp: msg
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .and_then(parse_timestamp),
                });
            }
        }
    }

    if let Some(reply) = envelope
        .get("response")
        .and_then(|r| r.get("content"))
        .and_then(assistant_reply)
    {
        conversation.push(Turn {
            role: Role::Assistant,
            content: reply,
            timestamp: None,
        });
    }

    conversation
}

/// Message content is a string or an array of `{type: "text", text}` parts.
fn message_text(content: &Value) -> Option<String> {
    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn assistant_reply(content: &Value) -> Option<String> {
    let reply = match content {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(decoded @ (Value::Object(_) | Value::Array(_))) => {
                return assistant_reply(&decoded)
            }
            Ok(Value::String(inner)) => inner,
            Ok(_) => s.clone(),
            Err(_) if is_event_stream(s) => event_stream_text(s),
            Err(_) => s.clone(),
        },
        Value::Array(chunks) => {
            let mut out = String::new();
            for chunk in chunks {
                push_delta_text(chunk, &mut out);
            }
            out
        }
        Value::Object(_) => content
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
        _ => String::new(),
    };
    (!reply.trim().is_empty()).then_some(reply)
}

fn push_delta_text(chunk: &Value, out: &mut String) {
    let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
        return;
    };
    for choice in choices {
        if let Some(text) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            out.push_str(text);
        }
    }
}

fn is_event_stream(body: &str) -> bool {
    body.lines().any(|l| l.trim_start().starts_with("data:"))
}

/// Concatenate the deltas of a server-sent-events body (`data: {...}` lines).
fn event_stream_text(body: &str) -> String {
    let mut out = String::new();
    for line in body.lines() {
        let Some(payload) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            continue;
        }
        if let Ok(chunk) = serde_json::from_str::<Value>(payload) {
            push_delta_text(&chunk, &mut out);
        }
    }
    out
}

fn extract_metadata(envelope: &Map<String, Value>, file_name: &str) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();

    if let Some(consumed) = envelope.get("proxy-time-consumed").filter(|v| !v.is_null()) {
        metadata.insert("proxy_time_consumed".to_string(), consumed.clone());
    }

    let name_parts = FileNameParts::parse(file_name);
    let header_editor = envelope
        .get("request")
        .and_then(|r| r.get("headers"))
        .and_then(Value::as_object)
        .and_then(|headers| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("editor-version"))
                .and_then(|(_, v)| v.as_str())
                .map(str::to_string)
        });

    if let Some(parts) = &name_parts {
        if let Some(machine) = &parts.machine_id {
            metadata.insert("machine_id".to_string(), Value::from(machine.as_str()));
        }
        if let Some(ip) = &parts.ip_address {
            metadata.insert("ip_address".to_string(), Value::from(ip.as_str()));
        }
    }
    if let Some(editor) = name_parts
        .and_then(|p| p.editor_version)
        .or(header_editor)
    {
        metadata.insert("editor_version".to_string(), Value::from(editor));
    }

    if let Some(model) = request_content(envelope)
        .and_then(|c| c.get("model").and_then(Value::as_str).map(str::to_string))
    {
        metadata.insert("model".to_string(), Value::from(model));
    }

    metadata
}

//! Elasticsearch sink.
//!
//! Documents are written with the `_bulk` API as `index` actions with an
//! explicit `_id`, which Elasticsearch treats as insert-or-overwrite. Each
//! monthly partition is created with the capture mapping the first time this
//! process writes to it.
//!
//! # Retry Strategy
//!
//! - HTTP 401/403 → [`SinkError::Unavailable`] immediately (credentials won't fix themselves)
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - Connection errors and timeouts → retry, then [`SinkError::Unavailable`]
//! - Other 4xx on the bulk request → [`SinkError::Protocol`]
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{BulkOperation, PerDocumentResult, Sink, SinkError};
use crate::config::SinkConfig;

pub struct ElasticsearchSink {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    index_prefix: String,
    max_retries: u32,
    shards: u32,
    replicas: u32,
    max_result_window: u32,
    /// Partitions known to exist, so each is checked once per process.
    known_partitions: Mutex<HashSet<String>>,
}

impl ElasticsearchSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.resolved_password(),
            index_prefix: config.index_prefix.clone(),
            max_retries: config.max_retries,
            shards: config.shards,
            replicas: config.replicas,
            max_result_window: config.max_result_window,
            known_partitions: Mutex::new(HashSet::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    /// Send a request, retrying transient failures.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, SinkError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(SinkError::Unavailable(format!(
                            "authentication failed ({})",
                            status
                        )));
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(%status, attempt, "sink busy; retrying");
                        last_err = Some(SinkError::Unavailable(format!(
                            "Elasticsearch error {}: {}",
                            status,
                            truncate(&body_text, 300)
                        )));
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "sink request failed");
                    last_err = Some(SinkError::Unavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| SinkError::Unavailable("request failed after retries".into())))
    }

    /// Create `partition` with the capture mapping unless it already exists.
    ///
    /// A mapping that cannot be applied is logged and left to the bulk
    /// request's index auto-creation; only unavailability is an error here.
    async fn ensure_partition(&self, partition: &str) -> Result<(), SinkError> {
        let mut known = self.known_partitions.lock().await;
        if known.contains(partition) {
            return Ok(());
        }

        let exists = self.send(|| self.request(Method::HEAD, partition)).await?;
        if exists.status().is_success() {
            known.insert(partition.to_string());
            return Ok(());
        }

        let body = self.partition_mapping();
        let response = self
            .send(|| self.request(Method::PUT, partition).json(&body))
            .await?;
        let status = response.status();
        if status.is_success() {
            tracing::info!(
                partition,
                shards = self.shards,
                replicas = self.replicas,
                "created index partition"
            );
            known.insert(partition.to_string());
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        if text.contains("resource_already_exists_exception") {
            known.insert(partition.to_string());
        } else {
            tracing::warn!(partition, %status, body = %truncate(&text, 300), "could not create partition mapping");
        }
        Ok(())
    }

    fn partition_mapping(&self) -> Value {
        json!({
            "settings": {
                "number_of_shards": self.shards,
                "number_of_replicas": self.replicas,
                "max_result_window": self.max_result_window,
            },
            "mappings": {
                "properties": {
                    "timestamp": {"type": "date"},
                    "file_name": {"type": "keyword"},
                    "user_id": {"type": "keyword"},
                    "conversation": {
                        "type": "nested",
                        "properties": {
                            "role": {"type": "keyword"},
                            "content": {"type": "text", "analyzer": "standard"},
                            "timestamp": {"type": "date"}
                        }
                    },
                    "metadata": {
                        "properties": {
                            "proxy_time_consumed": {"type": "keyword"},
                            "ip_address": {"type": "ip"},
                            "machine_id": {"type": "keyword"},
                            "editor_version": {"type": "keyword"},
                            "model": {"type": "keyword"}
                        }
                    }
                }
            }
        })
    }

    /// Newest documents for one user across every partition.
    pub async fn search_by_user(&self, user_id: &str, size: usize) -> Result<Vec<Value>, SinkError> {
        let body = json!({
            "query": {"term": {"user_id": user_id}},
            "sort": [{"timestamp": {"order": "desc"}}],
            "size": size,
        });
        let path = format!("{}-*/_search", self.index_prefix);
        let response = self
            .send(|| self.request(Method::POST, &path).json(&body))
            .await?;

        let status = response.status();
        let json: Value = response
            .json()
            .await
            .map_err(|e| SinkError::Protocol(format!("invalid search response: {}", e)))?;
        if !status.is_success() {
            return Err(SinkError::Protocol(format!("search failed {}: {}", status, json)));
        }

        Ok(json
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .map(|hits| hits.iter().filter_map(|h| h.get("_source").cloned()).collect())
            .unwrap_or_default())
    }
}

/// NDJSON body for `_bulk`: an action line and a source line per operation.
pub fn bulk_body(operations: &[BulkOperation]) -> Result<String, SinkError> {
    let mut body = String::new();
    for op in operations {
        let action = json!({"index": {"_index": op.index, "_id": op.id}});
        let source = serde_json::to_string(&op.document)
            .map_err(|e| SinkError::Protocol(format!("document not serializable: {}", e)))?;
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&source);
        body.push('\n');
    }
    Ok(body)
}

/// Map a `_bulk` response to per-operation results, in request order.
pub fn parse_bulk_response(json: &Value, expected: usize) -> Result<Vec<PerDocumentResult>, SinkError> {
    let items = json
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| SinkError::Protocol("bulk response has no items".into()))?;

    if items.len() != expected {
        return Err(SinkError::Protocol(format!(
            "bulk response has {} items for {} operations",
            items.len(),
            expected
        )));
    }

    items
        .iter()
        .map(|item| {
            let result = item
                .get("index")
                .or_else(|| item.as_object().and_then(|o| o.values().next()))
                .ok_or_else(|| SinkError::Protocol("bulk item without action".into()))?;
            let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
            if (200..300).contains(&status) {
                return Ok(PerDocumentResult::Committed);
            }
            let reason = match result.get("error") {
                Some(err) => format!(
                    "{}: {}",
                    err.get("type").and_then(Value::as_str).unwrap_or("error"),
                    err.get("reason").and_then(Value::as_str).unwrap_or("unknown")
                ),
                None => format!("status {}", status),
            };
            Ok(PerDocumentResult::Rejected { reason })
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl Sink for ElasticsearchSink {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn upload(&self, operations: &[BulkOperation]) -> Result<Vec<PerDocumentResult>, SinkError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let mut partitions: Vec<&str> = operations.iter().map(|op| op.index.as_str()).collect();
        partitions.sort_unstable();
        partitions.dedup();
        for partition in partitions {
            self.ensure_partition(partition).await?;
        }

        let body = bulk_body(operations)?;
        let response = self
            .send(|| {
                self.request(Method::POST, "_bulk")
                    .header("Content-Type", "application/x-ndjson")
                    .body(body.clone())
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SinkError::Protocol(format!(
                "bulk request failed {}: {}",
                status,
                truncate(&text, 300)
            )));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| SinkError::Protocol(format!("invalid bulk response: {}", e)))?;
        parse_bulk_response(&json, operations.len())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let response = self.send(|| self.request(Method::GET, "/")).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError::Unavailable(format!(
                "ping returned {}",
                response.status()
            )))
        }
    }
}

//! TOML configuration.
//!
//! ```toml
//! [source]
//! root = "/var/captures"
//! include_globs = ["**/*.json"]
//!
//! [sink]
//! url = "http://localhost:9200"
//! index_prefix = "copilot-chat-logs"
//!
//! [progress]
//! backend = "file"
//! path = "./data/processed_files.log"
//!
//! [pipeline]
//! max_batch_size = 100
//! ```
//!
//! Everything is read once at startup; there is no hot reload.

use anyhow::{bail, Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `sink.password`.
pub const SINK_PASSWORD_ENV: &str = "TSHIP_SINK_PASSWORD";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Which directory of a capture's relative path names the user.
    #[serde(default)]
    pub user_segment: usize,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default = "default_sink_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default = "default_max_result_window")]
    pub max_result_window: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: default_sink_url(),
            username: None,
            password: None,
            index_prefix: default_index_prefix(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            shards: default_shards(),
            replicas: 0,
            max_result_window: default_max_result_window(),
        }
    }
}

fn default_sink_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_index_prefix() -> String {
    "copilot-chat-logs".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_shards() -> u32 {
    1
}
fn default_max_result_window() -> u32 {
    10_000
}

impl SinkConfig {
    /// Password from the environment, falling back to the config file.
    pub fn resolved_password(&self) -> Option<String> {
        std::env::var(SINK_PASSWORD_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| self.password.clone())
    }

    /// Upper bound for one batch upload, retries and backoff included.
    pub fn upload_deadline(&self) -> Duration {
        let attempts = u64::from(self.max_retries) + 1;
        let backoff: u64 = (1..=u64::from(self.max_retries))
            .map(|attempt| 1u64 << (attempt - 1).min(5))
            .sum();
        Duration::from_secs(self.timeout_secs * attempts + backoff + 5)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProgressBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProgressConfig {
    #[serde(default)]
    pub backend: ProgressBackend,
    #[serde(default = "default_progress_path")]
    pub path: PathBuf,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            backend: ProgressBackend::default(),
            path: default_progress_path(),
        }
    }
}

fn default_progress_path() -> PathBuf {
    PathBuf::from("./data/processed_files.log")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub max_files_per_cycle: Option<usize>,
    #[serde(default = "default_parse_workers")]
    pub parse_workers: usize,
    /// Only used by `tship schedule` and as the fallback cycle in `tship watch`.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_files_per_cycle: None,
            parse_workers: default_parse_workers(),
            poll_interval_secs: default_poll_interval_secs(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

fn default_max_batch_size() -> usize {
    100
}
fn default_parse_workers() -> usize {
    4
}
fn default_poll_interval_secs() -> u64 {
    3000
}
fn default_watch_debounce_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.max_batch_size == 0 {
        bail!("pipeline.max_batch_size must be > 0");
    }
    if config.pipeline.parse_workers == 0 {
        bail!("pipeline.parse_workers must be > 0");
    }
    if config.pipeline.poll_interval_secs == 0 {
        bail!("pipeline.poll_interval_secs must be > 0");
    }
    if config.pipeline.max_files_per_cycle == Some(0) {
        bail!("pipeline.max_files_per_cycle must be > 0 when set");
    }
    if config.sink.timeout_secs == 0 {
        bail!("sink.timeout_secs must be > 0");
    }

    let prefix = &config.sink.index_prefix;
    if prefix.is_empty() {
        bail!("sink.index_prefix must not be empty");
    }
    if prefix.chars().any(|c| c.is_ascii_uppercase() || c == '*' || c == ',' || c.is_whitespace()) {
        bail!(
            "sink.index_prefix '{}' must be lowercase without '*', ',' or whitespace",
            prefix
        );
    }

    for pattern in config
        .source
        .include_globs
        .iter()
        .chain(config.source.exclude_globs.iter())
    {
        Glob::new(pattern).with_context(|| format!("Invalid glob pattern: '{}'", pattern))?;
    }

    Ok(())
}

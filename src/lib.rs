//! # Transcript Shipper
//!
//! Ships chat transcripts captured by an intercepting proxy into a
//! time-partitioned Elasticsearch index, so that every capture lands in the
//! index exactly once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Captures   │──▶│   Pipeline   │──▶│ Elasticsearch │
//! │ <root>/**   │   │ Parse+Batch  │   │ prefix-YYYY-MM│
//! └─────────────┘   └──────┬───────┘   └───────────────┘
//!                          │ commit after ack
//!                          ▼
//!                   ┌──────────────┐
//!                   │  Progress    │
//!                   │ file/sqlite  │
//!                   └──────────────┘
//! ```
//!
//! A file is committed to the progress store only after the sink has
//! acknowledged its document. A crash in between replays the file on the
//! next cycle, and the deterministic `document_id` turns the replay into an
//! overwrite.
//!
//! ## Quick Start
//!
//! ```bash
//! tship run                  # one cycle, exit 2 if the sink is unreachable
//! tship schedule             # a cycle every poll_interval_secs
//! tship watch                # a cycle whenever the capture tree changes
//! tship status
//! tship search alice --size 5
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`capture`] | Capture parser |
//! | [`discovery`] | Source tree walk |
//! | [`batch`] | Parallel parse and batch composition |
//! | [`store`] | Progress store backends |
//! | [`sink`] | Sink abstraction and Elasticsearch backend |
//! | [`pipeline`] | Cycle coordinator |
//! | [`driver`] | One-shot, interval, and watch drivers |
//! | [`report`] | Progress output on stderr |

pub mod batch;
pub mod capture;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod sink;
pub mod store;

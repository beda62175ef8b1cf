//! SBS-1 aircraft logger library.
//!
//! This library provides functionality to:
//! - Read a BaseStation (SBS-1) feed over TCP with automatic reconnects
//! - Enrich aircraft with registration, model and operator from HTTP lookups
//! - Throttle and deduplicate per-aircraft output
//! - Write one CSV log per UTC day, compressing and expiring old days
//! - Remember resolved aircraft across restarts
//! - Report log and heartbeat health
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │ Supervisor  │───▶│  Protocol   │───▶│  Tracker    │───▶│   Writer    │
//! │   (TCP)     │    │  (Parser)   │    │  (shards)   │    │ (daily CSV) │
//! └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘
//!                                              │
//!                                              ▼
//!                    ┌─────────────┐    ┌─────────────┐
//!                    │ Maintenance │───▶│  Enricher   │──▶ HTTP lookups
//!                    │ (scheduler) │    │(cache, backoff)
//!                    └─────────────┘    └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use airlogger::{
//!     client::{ClientConfig, HttpClient},
//!     clock::SystemClock,
//!     collector::{Collector, CollectorConfig},
//!     enricher::{Enricher, EnricherConfig},
//!     operators::OperatorDirectory,
//!     writer::LogWriter,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::new(ClientConfig::default())?;
//!     let enricher = Enricher::new(
//!         Arc::new(client),
//!         Arc::new(OperatorDirectory::builtin()),
//!         Arc::new(SystemClock),
//!         EnricherConfig::default(),
//!     );
//!
//!     let collector = Collector::new(
//!         CollectorConfig::default(),
//!         Arc::new(enricher),
//!         Arc::new(LogWriter::new("logs")),
//!         Arc::new(SystemClock),
//!     );
//!
//!     // Run until stopped
//!     collector.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod aircraft_db;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod clock;
pub mod collector;
pub mod config;
pub mod enricher;
pub mod heartbeat;
pub mod maintenance;
pub mod metadata;
pub mod operators;
pub mod protocol;
pub mod retention;
pub mod status;
pub mod supervisor;
pub mod tracker;
pub mod types;
pub mod writer;

pub use client::{ClientConfig, ClientError, HttpClient, MetadataFetch};
pub use collector::{Collector, CollectorConfig, CollectorError};
pub use enricher::{Enricher, EnricherConfig};
pub use protocol::{parse, parse_message};
pub use tracker::{Tracker, TrackerConfig};
pub use types::{LogRow, Metadata, Observation};
pub use writer::LogWriter;

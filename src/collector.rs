//! Continuous ingestion orchestrator.
//!
//! Wires the feed supervisor to the tracker shards, the log writer and the
//! maintenance task:
//!
//! ```text
//! supervisor -> parser -> shard queue (by hex) -> tracker -> writer
//!                                   ^
//!                       maintenance (evict)
//! ```

use crate::clock::SharedClock;
use crate::enricher::Enricher;
use crate::maintenance::{Maintenance, MaintenanceConfig};
use crate::protocol;
use crate::supervisor::{LineHandler, Supervisor, SupervisorConfig};
use crate::tracker::{Tracker, TrackerConfig};
use crate::types::Observation;
use crate::writer::LogWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Statistics for the collector.
#[derive(Debug, Default)]
pub struct CollectorStats {
    pub lines: AtomicU64,
    pub observations: AtomicU64,
    pub parse_errors: AtomicU64,
    pub rows_written: AtomicU64,
    pub write_errors: AtomicU64,
    /// Observations abandoned because processing panicked
    pub failed: AtomicU64,
    /// Observations since the last heartbeat
    pub processed_since_last: AtomicU64,
}

impl CollectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and reset the heartbeat counter.
    pub fn take_processed(&self) -> u64 {
        self.processed_since_last.swap(0, Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lines: self.lines.load(Ordering::Relaxed),
            observations: self.observations.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub lines: u64,
    pub observations: u64,
    pub parse_errors: u64,
    pub rows_written: u64,
    pub write_errors: u64,
    pub failed: u64,
}

/// Work item for a tracker shard.
#[derive(Debug)]
pub enum ShardCommand {
    Observe(Observation),
    /// Drop idle tracker records as of the given time
    Evict(DateTime<Utc>),
}

/// Shard index for `hex`; stable within a process.
pub fn shard_for(hex: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    hex.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Configuration for the collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub supervisor: SupervisorConfig,
    /// Applied per shard, with `max_entries` split across shards
    pub tracker: TrackerConfig,
    pub maintenance: MaintenanceConfig,
    /// Number of tracker shard workers
    pub shards: usize,
    /// Bound of each shard queue
    pub shard_queue: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            tracker: TrackerConfig::default(),
            maintenance: MaintenanceConfig::default(),
            shards: 4,
            shard_queue: 1024,
        }
    }
}

/// Parses feed lines and routes observations to their shard.
struct Router {
    shards: Vec<mpsc::Sender<ShardCommand>>,
    stats: Arc<CollectorStats>,
}

#[async_trait]
impl LineHandler for Router {
    async fn handle_line(&mut self, line: String) {
        self.stats.lines.fetch_add(1, Ordering::Relaxed);

        let obs = match protocol::parse_message(&line) {
            Ok(obs) => obs,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropping feed line ({}): {:?}", e, line);
                return;
            }
        };

        self.stats.observations.fetch_add(1, Ordering::Relaxed);
        self.stats.processed_since_last.fetch_add(1, Ordering::Relaxed);

        let idx = shard_for(&obs.hex, self.shards.len());
        if self.shards[idx].send(ShardCommand::Observe(obs)).await.is_err() {
            tracing::warn!("Shard {} queue closed", idx);
        }
    }
}

/// The main collector that orchestrates ingestion and persistence.
pub struct Collector {
    config: CollectorConfig,
    enricher: Arc<Enricher>,
    writer: Arc<LogWriter>,
    clock: SharedClock,
    stats: Arc<CollectorStats>,
    shutdown: watch::Sender<bool>,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        enricher: Arc<Enricher>,
        writer: Arc<LogWriter>,
        clock: SharedClock,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            enricher,
            writer,
            clock,
            stats: Arc::new(CollectorStats::new()),
            shutdown,
        }
    }

    /// Get a reference to the collector stats.
    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    pub fn writer(&self) -> &Arc<LogWriter> {
        &self.writer
    }

    /// Check if the collector is running.
    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Stop the collector. Queued observations are still processed.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<(), CollectorError> {
        if self.config.shards == 0 {
            return Err(CollectorError::Config("shard count must be at least 1".into()));
        }

        let (senders, workers) = self.spawn_shards();
        let maintenance = self.spawn_maintenance(senders.clone());

        let mut router = Router {
            shards: senders,
            stats: Arc::clone(&self.stats),
        };
        let mut supervisor = Supervisor::new(self.config.supervisor.clone(), self.shutdown.subscribe());
        supervisor.run(&mut router).await;

        // closing the queues lets the shards drain and exit
        drop(router);
        let mut result = maintenance.await.map_err(CollectorError::from);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Shard worker failed: {}", e);
                result = result.and(Err(e.into()));
            }
        }

        self.writer.close();
        if let Err(e) = self.enricher.persist() {
            tracing::error!("Failed to save aircraft database: {}", e);
        }
        let s = self.stats.snapshot();
        tracing::info!(
            "Collector stopped: lines={}, observations={}, parse_errors={}, rows={}, write_errors={}, failed={}",
            s.lines,
            s.observations,
            s.parse_errors,
            s.rows_written,
            s.write_errors,
            s.failed
        );
        result
    }

    fn spawn_shards(&self) -> (Vec<mpsc::Sender<ShardCommand>>, Vec<JoinHandle<()>>) {
        let shards = self.config.shards;
        let tracker_config = TrackerConfig {
            max_entries: (self.config.tracker.max_entries / shards).max(1),
            ..self.config.tracker.clone()
        };

        (0..shards)
            .map(|id| {
                let (tx, rx) = mpsc::channel(self.config.shard_queue.max(1));
                let tracker = Tracker::new(
                    Arc::clone(&self.enricher),
                    Arc::clone(&self.clock),
                    tracker_config.clone(),
                );
                let handle = tokio::spawn(shard_worker(
                    id,
                    rx,
                    tracker,
                    Arc::clone(&self.writer),
                    Arc::clone(&self.stats),
                ));
                (tx, handle)
            })
            .unzip()
    }

    fn spawn_maintenance(&self, shards: Vec<mpsc::Sender<ShardCommand>>) -> JoinHandle<()> {
        let maintenance = Maintenance::new(
            self.config.maintenance.clone(),
            Arc::clone(&self.enricher),
            shards,
            Arc::clone(&self.stats),
            Arc::clone(&self.clock),
        );
        tokio::spawn(maintenance.run(self.shutdown.subscribe()))
    }
}

async fn shard_worker(
    id: usize,
    mut rx: mpsc::Receiver<ShardCommand>,
    mut tracker: Tracker,
    writer: Arc<LogWriter>,
    stats: Arc<CollectorStats>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            ShardCommand::Observe(obs) => {
                let hex = obs.hex.clone();
                let row = match AssertUnwindSafe(tracker.observe(obs)).catch_unwind().await {
                    Ok(Some(row)) => row,
                    Ok(None) => continue,
                    Err(panic) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            "Shard {} failed processing {}: {}",
                            id,
                            hex,
                            panic_message(panic.as_ref())
                        );
                        continue;
                    }
                };
                if writer.append(&row) {
                    stats.rows_written.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.write_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            ShardCommand::Evict(now) => {
                let removed = tracker.evict(now);
                tracing::debug!(
                    "Shard {} evicted {} aircraft, {} tracked",
                    id,
                    removed,
                    tracker.len()
                );
            }
        }
    }
    tracing::debug!("Shard {} drained", id);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

//! Periodic housekeeping: cache cleanup, throttle-map cleanup, log retention
//! and the heartbeat. The aircraft database is saved alongside each heartbeat.
//!
//! One task ticks every few seconds and runs whichever jobs are due, so a
//! slow job only delays the others and never the ingestion path.

use crate::clock::{elapsed_between, Clock, SharedClock};
use crate::collector::{CollectorStats, ShardCommand};
use crate::enricher::Enricher;
use crate::heartbeat::{self, Heartbeat};
use crate::retention;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    CacheCleanup,
    ThrottleCleanup,
    Retention,
    Heartbeat,
}

/// Configuration for the maintenance task.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often due times are checked
    pub tick: Duration,
    pub cache_cleanup_interval: Duration,
    pub throttle_cleanup_interval: Duration,
    pub retention_interval: Duration,
    pub heartbeat_interval: Duration,
    pub log_dir: PathBuf,
    pub heartbeat_path: PathBuf,
    pub retention_days: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            cache_cleanup_interval: Duration::from_secs(3600),
            throttle_cleanup_interval: Duration::from_secs(3600),
            retention_interval: Duration::from_secs(24 * 3600),
            heartbeat_interval: Duration::from_secs(300),
            log_dir: PathBuf::from("logs"),
            heartbeat_path: PathBuf::from("logs/heartbeat.json"),
            retention_days: 30,
        }
    }
}

struct Slot {
    job: Job,
    interval: Duration,
    last_run: Option<DateTime<Utc>>,
}

/// Due-time bookkeeping for the jobs.
///
/// Heartbeat and retention are due immediately; the cleanups first run one
/// interval after `start`.
pub struct Schedule {
    slots: Vec<Slot>,
}

impl Schedule {
    pub fn new(config: &MaintenanceConfig, start: DateTime<Utc>) -> Self {
        let slot = |job, interval, last_run| Slot {
            job,
            interval,
            last_run,
        };
        Self {
            slots: vec![
                slot(Job::Heartbeat, config.heartbeat_interval, None),
                slot(Job::CacheCleanup, config.cache_cleanup_interval, Some(start)),
                slot(Job::ThrottleCleanup, config.throttle_cleanup_interval, Some(start)),
                slot(Job::Retention, config.retention_interval, None),
            ],
        }
    }

    /// Jobs due at `now`; each returned job is marked as run.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Job> {
        self.slots
            .iter_mut()
            .filter(|slot| match slot.last_run {
                None => true,
                Some(last) => elapsed_between(last, now) >= slot.interval,
            })
            .map(|slot| {
                slot.last_run = Some(now);
                slot.job
            })
            .collect()
    }
}

pub struct Maintenance {
    config: MaintenanceConfig,
    enricher: Arc<Enricher>,
    shards: Vec<mpsc::Sender<ShardCommand>>,
    stats: Arc<CollectorStats>,
    clock: SharedClock,
}

impl Maintenance {
    pub fn new(
        config: MaintenanceConfig,
        enricher: Arc<Enricher>,
        shards: Vec<mpsc::Sender<ShardCommand>>,
        stats: Arc<CollectorStats>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            enricher,
            shards,
            stats,
            clock,
        }
    }

    /// Tick until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut schedule = Schedule::new(&self.config, self.clock.now());
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            let now = self.clock.now();
            for job in schedule.due(now) {
                self.run_job(job, now).await;
            }
        }

        tracing::debug!("Maintenance stopped");
    }

    pub async fn run_job(&self, job: Job, now: DateTime<Utc>) {
        match job {
            Job::CacheCleanup => {
                let removed = self.enricher.evict(now);
                tracing::info!(
                    "Cache cleanup removed {} entries, {} remain",
                    removed,
                    self.enricher.cache().len()
                );
            }
            Job::ThrottleCleanup => {
                for shard in &self.shards {
                    if shard.send(ShardCommand::Evict(now)).await.is_err() {
                        tracing::debug!("Shard closed before throttle cleanup");
                    }
                }
            }
            Job::Retention => {
                let dir = self.config.log_dir.clone();
                let days = self.config.retention_days;
                let today = now.date_naive();
                match tokio::task::spawn_blocking(move || retention::run(&dir, today, days)).await {
                    Ok(Ok(report)) => tracing::info!(
                        "Retention: {} compressed, {} deleted, {} failed",
                        report.compressed.len(),
                        report.deleted.len(),
                        report.failed
                    ),
                    Ok(Err(e)) => tracing::error!("Retention failed: {}", e),
                    Err(e) => tracing::error!("Retention task panicked: {}", e),
                }
            }
            Job::Heartbeat => {
                self.beat(now);
                self.save_store().await;
            }
        }
    }

    async fn save_store(&self) {
        if self.enricher.store().is_none() {
            return;
        }
        let enricher = Arc::clone(&self.enricher);
        match tokio::task::spawn_blocking(move || enricher.persist()).await {
            Ok(Ok(true)) => tracing::debug!("Aircraft database saved"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => tracing::error!("Failed to save aircraft database: {}", e),
            Err(e) => tracing::error!("Aircraft database save panicked: {}", e),
        }
    }

    fn beat(&self, now: DateTime<Utc>) {
        let hb = Heartbeat::new(
            now,
            self.stats.take_processed(),
            self.enricher.cache().len() as u64,
        );
        match heartbeat::write(&self.config.heartbeat_path, &hb) {
            Ok(()) => tracing::debug!(
                "Heartbeat: {} processed, cache size {}",
                hb.processed_since_last,
                hb.cache_size
            ),
            Err(e) => tracing::error!(
                "Failed to write heartbeat {}: {}",
                self.config.heartbeat_path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft_db::AircraftDb;
    use crate::clock::ManualClock;
    use crate::enricher::tests::StubFetcher;
    use crate::enricher::EnricherConfig;
    use crate::operators::OperatorDirectory;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_schedule_due_times() {
        let mut schedule = Schedule::new(&MaintenanceConfig::default(), t0());

        assert_eq!(schedule.due(t0()), vec![Job::Heartbeat, Job::Retention]);
        assert!(schedule.due(at(5)).is_empty());
        assert_eq!(schedule.due(at(300)), vec![Job::Heartbeat]);
        assert_eq!(
            schedule.due(at(3600)),
            vec![Job::Heartbeat, Job::CacheCleanup, Job::ThrottleCleanup]
        );
        assert_eq!(schedule.due(at(86_400)).len(), 4);
    }

    #[tokio::test]
    async fn test_jobs_touch_cache_shards_and_heartbeat() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(t0());
        let enricher = Arc::new(Enricher::new(
            Arc::new(StubFetcher::always(|| Ok(json!({"registration": "N1"})))),
            Arc::new(OperatorDirectory::builtin()),
            Arc::new(clock.clone()),
            EnricherConfig::default(),
        ));
        enricher.resolve("a00001").await;

        let stats = Arc::new(CollectorStats::new());
        stats.observations.fetch_add(7, Ordering::Relaxed);
        stats.processed_since_last.fetch_add(7, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::channel(4);
        let config = MaintenanceConfig {
            log_dir: dir.path().to_path_buf(),
            heartbeat_path: dir.path().join("heartbeat.json"),
            ..Default::default()
        };
        let maintenance = Maintenance::new(
            config,
            enricher.clone(),
            vec![tx],
            stats.clone(),
            Arc::new(clock.clone()),
        );

        maintenance.run_job(Job::Heartbeat, t0()).await;
        let hb = heartbeat::read(&dir.path().join("heartbeat.json")).unwrap();
        assert_eq!(hb.processed_since_last, 7);
        assert_eq!(hb.cache_size, 1);
        assert_eq!(stats.processed_since_last.load(Ordering::Relaxed), 0);

        maintenance.run_job(Job::ThrottleCleanup, at(60)).await;
        assert!(matches!(rx.recv().await, Some(ShardCommand::Evict(t)) if t == at(60)));

        maintenance.run_job(Job::CacheCleanup, at(2 * 86_400)).await;
        assert_eq!(enricher.cache().len(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_saves_aircraft_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("aircraft_db.json");
        let clock = ManualClock::new(t0());
        let enricher = Arc::new(
            Enricher::new(
                Arc::new(StubFetcher::always(|| Ok(json!({"registration": "N5"})))),
                Arc::new(OperatorDirectory::builtin()),
                Arc::new(clock.clone()),
                EnricherConfig::default(),
            )
            .with_store(Arc::new(AircraftDb::open(&db_path))),
        );
        enricher.resolve("a00005").await;
        assert!(!db_path.exists());

        let config = MaintenanceConfig {
            log_dir: dir.path().to_path_buf(),
            heartbeat_path: dir.path().join("heartbeat.json"),
            ..Default::default()
        };
        let maintenance = Maintenance::new(
            config,
            enricher,
            Vec::new(),
            Arc::new(CollectorStats::new()),
            Arc::new(clock.clone()),
        );
        maintenance.run_job(Job::Heartbeat, t0()).await;

        assert_eq!(AircraftDb::open(&db_path).get("A00005").unwrap().registration, "N5");
    }
}

//! Per-aircraft state tracking, throttling and change detection.
//!
//! A [`Tracker`] is owned by exactly one task; observations for a given hex
//! always reach the same tracker, so no per-record locking is needed.

use crate::clock::{elapsed_between, Clock, SharedClock};
use crate::enricher::Enricher;
use crate::types::{merge_field, LogRow, Metadata, Observation};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum time between two rows for one aircraft
    pub throttle: Duration,
    /// Records unseen for longer than this are evicted
    pub idle_expiry: Duration,
    /// Upper bound on tracked aircraft
    pub max_entries: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(60),
            idle_expiry: Duration::from_secs(24 * 3600),
            max_entries: 5_000,
        }
    }
}

/// Output-relevant fields, compared against the previous write.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RowKey([String; 8]);

/// Latest known state of one aircraft.
#[derive(Debug, Clone)]
pub struct AircraftRecord {
    pub hex: String,
    pub last_seen: DateTime<Utc>,
    pub callsign: String,
    pub altitude: String,
    pub speed: String,
    pub latitude: String,
    pub longitude: String,
    pub metadata: Metadata,
    last_write: Option<DateTime<Utc>>,
    last_written: Option<RowKey>,
}

impl AircraftRecord {
    fn new(hex: String, now: DateTime<Utc>) -> Self {
        Self {
            hex,
            last_seen: now,
            callsign: String::new(),
            altitude: String::new(),
            speed: String::new(),
            latitude: String::new(),
            longitude: String::new(),
            metadata: Metadata::default(),
            last_write: None,
            last_written: None,
        }
    }

    /// Fold an observation in; blank values never replace known ones.
    pub fn merge(&mut self, obs: &Observation) {
        merge_field(&mut self.callsign, &obs.callsign);
        merge_field(&mut self.altitude, &obs.altitude);
        merge_field(&mut self.speed, &obs.speed);
        merge_field(&mut self.latitude, &obs.latitude);
        merge_field(&mut self.longitude, &obs.longitude);
    }

    pub fn last_write(&self) -> Option<DateTime<Utc>> {
        self.last_write
    }
}

pub struct Tracker {
    records: HashMap<String, AircraftRecord>,
    enricher: Arc<Enricher>,
    clock: SharedClock,
    config: TrackerConfig,
}

impl Tracker {
    pub fn new(enricher: Arc<Enricher>, clock: SharedClock, config: TrackerConfig) -> Self {
        Self {
            records: HashMap::new(),
            enricher,
            clock,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, hex: &str) -> Option<&AircraftRecord> {
        self.records.get(hex)
    }

    /// Apply an observation; returns the row to log, if one is due.
    pub async fn observe(&mut self, obs: Observation) -> Option<LogRow> {
        let now = self.clock.now();
        let enricher = Arc::clone(&self.enricher);

        let record = self
            .records
            .entry(obs.hex.clone())
            .or_insert_with(|| AircraftRecord::new(obs.hex.clone(), now));
        record.last_seen = now;
        record.merge(&obs);

        if let Some(last) = record.last_write {
            if elapsed_between(last, now) < self.config.throttle {
                return None;
            }
        }

        if record.metadata.lacks_identity() {
            let resolved = enricher.resolve(&record.hex).await;
            record.metadata.merge(&resolved);
        }

        let callsign = if record.callsign.is_empty() {
            record.metadata.callsign.clone()
        } else {
            record.callsign.clone()
        };
        let operator = if record.metadata.operator.is_empty() {
            enricher.operator_for_callsign(&callsign).unwrap_or_default()
        } else {
            record.metadata.operator.clone()
        };

        let key = RowKey([
            callsign.clone(),
            record.altitude.clone(),
            record.speed.clone(),
            record.latitude.clone(),
            record.longitude.clone(),
            record.metadata.registration.clone(),
            record.metadata.model.clone(),
            operator.clone(),
        ]);
        if record.last_written.as_ref() == Some(&key) {
            tracing::trace!("No change for {}, skipping row", record.hex);
            return None;
        }

        let row = LogRow {
            timestamp: now,
            hex: record.hex.clone(),
            callsign,
            altitude: record.altitude.clone(),
            speed: record.speed.clone(),
            latitude: record.latitude.clone(),
            longitude: record.longitude.clone(),
            registration: record.metadata.registration.clone(),
            model: record.metadata.model.clone(),
            operator,
        };
        record.last_write = Some(now);
        record.last_written = Some(key);

        Some(row)
    }

    /// Drop idle records, then the least recently seen ones over the cap.
    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        let idle = self.config.idle_expiry;

        self.records
            .retain(|_, r| elapsed_between(r.last_seen, now) <= idle);

        if self.records.len() > self.config.max_entries {
            let mut by_age: Vec<(DateTime<Utc>, String)> = self
                .records
                .values()
                .map(|r| (r.last_seen, r.hex.clone()))
                .collect();
            by_age.sort();
            let excess = self.records.len() - self.config.max_entries;
            for (_, hex) in by_age.into_iter().take(excess) {
                self.records.remove(&hex);
            }
        }

        before - self.records.len()
    }
}

//! Persistent database of aircraft identities learned from lookups.
//!
//! Stored as one JSON object keyed by lowercase hex. A field is filled the
//! first time a lookup returns it and kept afterwards; `last_seen` moves
//! forward on every successful lookup. The file is replaced atomically the
//! same way as the heartbeat.

use crate::types::Metadata;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AircraftDbError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid aircraft database {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredAircraft {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub callsign: String,
    /// Unix seconds of the last successful lookup
    #[serde(default)]
    pub last_seen: f64,
}

impl StoredAircraft {
    pub fn metadata(&self) -> Metadata {
        Metadata::new(
            self.registration.clone(),
            self.model.clone(),
            self.operator.clone(),
            self.callsign.clone(),
        )
    }

    pub fn last_seen_time(&self) -> Option<DateTime<Utc>> {
        if !self.last_seen.is_finite() {
            return None;
        }
        Utc.timestamp_millis_opt((self.last_seen * 1000.0) as i64).single()
    }

    /// Fill blank fields from `meta`. True when anything was added.
    fn fill(&mut self, meta: &Metadata) -> bool {
        let mut changed = false;
        for (slot, value) in [
            (&mut self.registration, &meta.registration),
            (&mut self.model, &meta.model),
            (&mut self.operator, &meta.operator),
            (&mut self.callsign, &meta.callsign),
        ] {
            if slot.is_empty() && !value.is_empty() {
                slot.clone_from(value);
                changed = true;
            }
        }
        changed
    }
}

pub struct AircraftDb {
    path: PathBuf,
    entries: Mutex<HashMap<String, StoredAircraft>>,
    dirty: AtomicBool,
}

impl AircraftDb {
    /// Open the database at `path`. A missing file is an empty database; a
    /// corrupt one is logged and replaced on the next save.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load(&path) {
            Ok(entries) => {
                tracing::info!("Loaded {} aircraft from {}", entries.len(), path.display());
                entries
            }
            Err(AircraftDbError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!("Starting with an empty aircraft database: {}", e);
                HashMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, hex: &str) -> Option<StoredAircraft> {
        self.entries.lock().get(&key(hex)).cloned()
    }

    /// Entries with a usable timestamp, as (hex, metadata, last seen).
    pub fn snapshot(&self) -> Vec<(String, Metadata, DateTime<Utc>)> {
        self.entries
            .lock()
            .iter()
            .filter_map(|(hex, a)| Some((hex.clone(), a.metadata(), a.last_seen_time()?)))
            .collect()
    }

    /// Merge a successful lookup. Empty metadata is ignored.
    pub fn record(&self, hex: &str, meta: &Metadata, now: DateTime<Utc>) {
        let hex = key(hex);
        if hex.is_empty() || meta.is_empty() {
            return;
        }

        let mut entries = self.entries.lock();
        let entry = entries.entry(hex).or_default();
        entry.fill(meta);
        entry.last_seen = now.timestamp_millis() as f64 / 1000.0;
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Write the database if it changed since the last save. Returns whether
    /// a write happened.
    pub fn save(&self) -> Result<bool, AircraftDbError> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(false);
        }

        let body = {
            let entries = self.entries.lock();
            serde_json::to_vec_pretty(&*entries)
        };
        let result = body
            .map_err(|source| AircraftDbError::Json {
                path: self.path.clone(),
                source,
            })
            .and_then(|body| {
                write_atomic(&self.path, &body).map_err(|source| AircraftDbError::Io {
                    path: self.path.clone(),
                    source,
                })
            });

        if result.is_err() {
            // retry on the next save
            self.dirty.store(true, Ordering::Relaxed);
        }
        result.map(|_| true)
    }
}

fn key(hex: &str) -> String {
    hex.trim().to_ascii_lowercase()
}

fn load(path: &Path) -> Result<HashMap<String, StoredAircraft>, AircraftDbError> {
    let bytes = fs::read(path).map_err(|source| AircraftDbError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: HashMap<String, StoredAircraft> =
        serde_json::from_slice(&bytes).map_err(|source| AircraftDbError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(raw.into_iter().map(|(hex, a)| (key(&hex), a)).collect())
}

fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "aircraft_db.json".into());
    name.push(".tmp");
    let tmp = path.with_file_name(name);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

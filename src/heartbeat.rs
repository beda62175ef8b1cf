//! Liveness heartbeat file.
//!
//! The document is replaced atomically (write to a sibling temp file, then
//! rename), so readers never see a partial write.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid heartbeat document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Unix seconds
    pub timestamp: f64,
    pub iso: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub processed_since_last: u64,
    #[serde(default)]
    pub cache_size: u64,
}

impl Heartbeat {
    pub fn new(now: DateTime<Utc>, processed_since_last: u64, cache_size: u64) -> Self {
        Self {
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            iso: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            pid: std::process::id(),
            processed_since_last,
            cache_size,
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        if !self.timestamp.is_finite() {
            return None;
        }
        Utc.timestamp_millis_opt((self.timestamp * 1000.0) as i64).single()
    }

    /// Age relative to `now`; zero for heartbeats from the future. `None`
    /// when the timestamp is not a representable time.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.timestamp.is_finite() {
            return None;
        }
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        Duration::try_from_secs_f64((now_secs - self.timestamp).max(0.0)).ok()
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now).is_some_and(|age| age <= threshold)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "heartbeat".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `heartbeat` to `path` atomically.
pub fn write(path: &Path, heartbeat: &Heartbeat) -> Result<(), HeartbeatError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path(path);
    let body = serde_json::to_vec(heartbeat)?;
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

pub fn read(path: &Path) -> Result<Heartbeat, HeartbeatError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

//! Read-side aggregation of the daily logs and heartbeat for health reporting.

use crate::heartbeat::{self, Heartbeat, HeartbeatError};
use crate::types::split_csv_line;
use crate::writer::log_file_name;
use chrono::{DateTime, NaiveDate, Utc};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Aggregates for one day's log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub total_rows: usize,
    pub unique_aircraft: usize,
    pub top_operators: Vec<(String, usize)>,
    /// Most recent row as column name / value pairs.
    pub latest: Option<Vec<(String, String)>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub heartbeat: Option<Heartbeat>,
    pub age_seconds: Option<f64>,
    pub threshold_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub summary: DailySummary,
    pub health: HealthReport,
}

const TOP_OPERATORS: usize = 5;

/// Summarize the log for `date`, reading the plain or gzipped file.
/// A missing file yields an empty summary.
pub fn summarize_day(dir: &Path, date: NaiveDate) -> Result<DailySummary, StatusError> {
    let plain = dir.join(log_file_name(date));
    let mut gz = plain.clone().into_os_string();
    gz.push(".gz");
    let gz = PathBuf::from(gz);

    let (path, reader): (PathBuf, Box<dyn Read>) = if plain.exists() {
        let file = open(&plain)?;
        (plain, Box::new(file))
    } else if gz.exists() {
        let file = open(&gz)?;
        (gz, Box::new(GzDecoder::new(file)))
    } else {
        return Ok(DailySummary {
            date: date.to_string(),
            ..Default::default()
        });
    };

    summarize(BufReader::new(reader), date).map_err(|source| StatusError::Io { path, source })
}

fn open(path: &Path) -> Result<File, StatusError> {
    File::open(path).map_err(|source| StatusError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn summarize(reader: impl BufRead, date: NaiveDate) -> io::Result<DailySummary> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => split_csv_line(&line?),
        None => {
            return Ok(DailySummary {
                date: date.to_string(),
                ..Default::default()
            })
        }
    };
    let hex_idx = header.iter().position(|h| h == "Hex");
    let operator_idx = header.iter().position(|h| h == "Operator");

    let mut total_rows = 0;
    let mut hexes = HashSet::new();
    let mut operators: HashMap<String, usize> = HashMap::new();
    let mut latest = None;

    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(&line);
        total_rows += 1;

        if let Some(hex) = hex_idx.and_then(|i| fields.get(i)) {
            hexes.insert(hex.clone());
        }
        if let Some(op) = operator_idx.and_then(|i| fields.get(i)).filter(|op| !op.is_empty()) {
            *operators.entry(op.clone()).or_default() += 1;
        }
        latest = Some(fields);
    }

    let mut top_operators: Vec<(String, usize)> = operators.into_iter().collect();
    top_operators.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_operators.truncate(TOP_OPERATORS);

    Ok(DailySummary {
        date: date.to_string(),
        total_rows,
        unique_aircraft: hexes.len(),
        top_operators,
        latest: latest.map(|fields| header.iter().cloned().zip(fields).collect()),
    })
}

/// Heartbeat health against `threshold`. A missing or unreadable heartbeat
/// is unhealthy.
pub fn health(heartbeat_path: &Path, now: DateTime<Utc>, threshold: Duration) -> HealthReport {
    let heartbeat = match heartbeat::read(heartbeat_path) {
        Ok(hb) => Some(hb),
        Err(HeartbeatError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!("Unreadable heartbeat {}: {}", heartbeat_path.display(), e);
            None
        }
    };
    let age = heartbeat.as_ref().and_then(|hb| hb.age(now));

    HealthReport {
        healthy: age.is_some_and(|a| a <= threshold),
        age_seconds: age.map(|a| a.as_secs_f64()),
        heartbeat,
        threshold_seconds: threshold.as_secs(),
    }
}

/// Full status for today.
pub fn report(
    log_dir: &Path,
    heartbeat_path: &Path,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Result<StatusReport, StatusError> {
    Ok(StatusReport {
        summary: summarize_day(log_dir, now.date_naive())?,
        health: health(heartbeat_path, now, threshold),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::header_line;
    use chrono::TimeZone;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn sample_log() -> String {
        [
            header_line(),
            "2024-04-02 10:00:00,AAAAAA,BAW1,,,,,G-AAAA,A320,British Airways".to_string(),
            "2024-04-02 10:01:00,BBBBBB,EZY2,,,,,G-BBBB,A319,easyJet".to_string(),
            "2024-04-02 10:02:00,AAAAAA,BAW1,1000,,,,G-AAAA,A320,British Airways".to_string(),
            "2024-04-02 10:03:00,CCCCCC,,,,,,,,".to_string(),
        ]
        .join("\n")
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 2).unwrap()
    }

    #[test]
    fn test_summarize_plain_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("aircraft_log_2024-04-02.csv"), sample_log()).unwrap();

        let summary = summarize_day(dir.path(), date()).unwrap();
        assert_eq!(summary.total_rows, 4);
        assert_eq!(summary.unique_aircraft, 3);
        assert_eq!(
            summary.top_operators,
            vec![("British Airways".to_string(), 2), ("easyJet".to_string(), 1)]
        );
        let latest = summary.latest.unwrap();
        assert_eq!(latest[1], ("Hex".to_string(), "CCCCCC".to_string()));
    }

    #[test]
    fn test_summarize_gzipped_file() {
        let dir = tempdir().unwrap();
        let file = File::create(dir.path().join("aircraft_log_2024-04-02.csv.gz")).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(sample_log().as_bytes()).unwrap();
        enc.finish().unwrap();

        let summary = summarize_day(dir.path(), date()).unwrap();
        assert_eq!(summary.total_rows, 4);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let summary = summarize_day(dir.path(), date()).unwrap();
        assert_eq!(summary.total_rows, 0);
        assert!(summary.latest.is_none());
    }

    #[test]
    fn test_health_thresholds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        let now = Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap();
        let threshold = Duration::from_secs(600);

        assert!(!health(&path, now, threshold).healthy);

        heartbeat::write(&path, &Heartbeat::new(now, 1, 1)).unwrap();
        assert!(health(&path, now + chrono::Duration::seconds(30), threshold).healthy);

        let stale = health(&path, now + chrono::Duration::seconds(10_000), threshold);
        assert!(!stale.healthy);
        assert_eq!(stale.age_seconds, Some(10_000.0));
    }

    #[test]
    fn test_garbage_heartbeat_time_is_unhealthy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        std::fs::write(&path, r#"{"timestamp": -1e30, "iso": "x"}"#).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap();

        let report = health(&path, now, Duration::from_secs(600));
        assert!(!report.healthy);
        assert!(report.heartbeat.is_some());
        assert_eq!(report.age_seconds, None);
    }
}

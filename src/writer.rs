//! Daily CSV log writer.
//!
//! One file per UTC day, `aircraft_log_YYYY-MM-DD.csv`, each starting with
//! the header row. Rows are flushed as soon as they are written so a killed
//! process loses at most the row in flight.

use crate::types::{csv_line, LogRow, LOG_HEADER};
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub const LOG_FILE_PREFIX: &str = "aircraft_log_";

/// File name of the log for `date`.
pub fn log_file_name(date: NaiveDate) -> String {
    format!("{}{}.csv", LOG_FILE_PREFIX, date.format("%Y-%m-%d"))
}

/// Date encoded in a log file name (`.csv` or `.csv.gz`).
pub fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix(LOG_FILE_PREFIX)?;
    let rest = rest.strip_suffix(".gz").unwrap_or(rest);
    let date = rest.strip_suffix(".csv")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// The header line as written to every file.
pub fn header_line() -> String {
    csv_line(LOG_HEADER)
}

struct OpenLog {
    date: NaiveDate,
    path: PathBuf,
    file: File,
}

pub struct LogWriter {
    dir: PathBuf,
    current: Mutex<Option<OpenLog>>,
    rows_written: AtomicU64,
    write_errors: AtomicU64,
}

impl LogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: Mutex::new(None),
            rows_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(log_file_name(date))
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Append a row. Failures are logged and swallowed; the next call
    /// reopens the file.
    pub fn append(&self, row: &LogRow) -> bool {
        match self.try_append(row) {
            Ok(()) => {
                self.rows_written.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to log row for {}: {}", row.hex, e);
                false
            }
        }
    }

    /// Append a row, reporting the failure.
    pub fn try_append(&self, row: &LogRow) -> Result<(), WriterError> {
        let date = row.timestamp.date_naive();
        let mut current = self.current.lock();

        if current.as_ref().map(|log| log.date) != Some(date) {
            if let Some(mut old) = current.take() {
                if let Err(e) = old.file.flush() {
                    tracing::warn!("Flush of {} failed: {}", old.path.display(), e);
                }
                tracing::info!("Closed log file {}", old.path.display());
            }
            *current = Some(self.open(date)?);
        }

        let Some(log) = current.as_mut() else {
            return Ok(());
        };

        let mut line = row.to_csv_line();
        line.push('\n');
        let result = log
            .file
            .write_all(line.as_bytes())
            .and_then(|_| log.file.flush());

        if let Err(source) = result {
            let path = log.path.clone();
            // reopen on the next row
            *current = None;
            return Err(WriterError::Io { path, source });
        }
        Ok(())
    }

    fn open(&self, date: NaiveDate) -> Result<OpenLog, WriterError> {
        let path = self.path_for(date);
        let io_err = |source| WriterError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        let len = file.metadata().map_err(io_err)?.len();
        if len == 0 {
            let mut header = header_line();
            header.push('\n');
            file.write_all(header.as_bytes()).map_err(io_err)?;
            file.flush().map_err(io_err)?;
        } else if !ends_with_newline(&mut file, len).map_err(io_err)? {
            // a row cut short by a crash; start the next one on its own line
            tracing::warn!("Terminating partial last line of {}", path.display());
            file.write_all(b"\n").map_err(io_err)?;
            file.flush().map_err(io_err)?;
        }

        tracing::info!("Logging to {}", path.display());
        Ok(OpenLog { date, path, file })
    }

    /// Flush and release the open file.
    pub fn close(&self) {
        if let Some(mut log) = self.current.lock().take() {
            if let Err(e) = log.file.flush().and_then(|_| log.file.sync_all()) {
                tracing::error!("Failed to close {}: {}", log.path.display(), e);
            }
        }
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn row_at(h: u32, m: u32, s: u32, day: u32, hex: &str) -> LogRow {
        LogRow {
            timestamp: Utc.with_ymd_and_hms(2024, 2, day, h, m, s).unwrap(),
            hex: hex.into(),
            callsign: "CALL".into(),
            altitude: String::new(),
            speed: String::new(),
            latitude: String::new(),
            longitude: String::new(),
            registration: String::new(),
            model: String::new(),
            operator: String::new(),
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempdir().unwrap();
        let writer = LogWriter::new(dir.path());

        assert!(writer.append(&row_at(10, 0, 0, 5, "AAAAAA")));
        assert!(writer.append(&row_at(10, 1, 0, 5, "BBBBBB")));
        writer.close();
        // a fresh writer must not repeat the header
        let writer = LogWriter::new(dir.path());
        assert!(writer.append(&row_at(10, 2, 0, 5, "CCCCCC")));

        let content = fs::read_to_string(dir.path().join("aircraft_log_2024-02-05.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "Time UTC,Hex,Callsign,Altitude,Speed,Latitude,Longitude,Registration,Model,Operator"
        );
        assert_eq!(lines[1], "2024-02-05 10:00:00,AAAAAA,CALL,,,,,,,");
        assert_eq!(writer.rows_written(), 1);
    }

    #[test]
    fn test_day_rollover_starts_new_file() {
        let dir = tempdir().unwrap();
        let writer = LogWriter::new(dir.path());

        writer.append(&row_at(23, 59, 59, 5, "AAAAAA"));
        writer.append(&row_at(0, 0, 1, 6, "BBBBBB"));

        for (day, hex) in [("2024-02-05", "AAAAAA"), ("2024-02-06", "BBBBBB")] {
            let content =
                fs::read_to_string(dir.path().join(format!("aircraft_log_{day}.csv"))).unwrap();
            let lines: Vec<&str> = content.lines().collect();
            assert_eq!(lines.len(), 2);
            assert_eq!(lines[0], header_line());
            assert!(lines[1].contains(hex));
        }
    }

    #[test]
    fn test_failure_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        // a regular file where the log directory should be
        let blocker = dir.path().join("logs");
        fs::write(&blocker, b"not a dir").unwrap();
        let writer = LogWriter::new(&blocker);

        assert!(!writer.append(&row_at(1, 0, 0, 7, "AAAAAA")));
        assert_eq!(writer.write_errors(), 1);

        // recovers once the path becomes usable
        fs::remove_file(&blocker).unwrap();
        assert!(writer.append(&row_at(1, 0, 1, 7, "AAAAAA")));
    }

    #[test]
    fn test_file_name_round_trip() {
        let date = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        assert_eq!(log_file_name(date), "aircraft_log_2023-12-31.csv");
        assert_eq!(date_from_file_name("aircraft_log_2023-12-31.csv"), Some(date));
        assert_eq!(date_from_file_name("aircraft_log_2023-12-31.csv.gz"), Some(date));
        assert_eq!(date_from_file_name("heartbeat.json"), None);
        assert_eq!(date_from_file_name("aircraft_log_bad.csv"), None);
    }

    #[test]
    fn test_partial_last_line_is_terminated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aircraft_log_2024-02-05.csv");
        fs::write(&path, format!("{}\n2024-02-05 09:00:00,AAAAAA,CA", header_line())).unwrap();

        let writer = LogWriter::new(dir.path());
        assert!(writer.append(&row_at(10, 0, 0, 5, "BBBBBB")));
        writer.close();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "2024-02-05 09:00:00,AAAAAA,CA");
        assert_eq!(lines[2], "2024-02-05 10:00:00,BBBBBB,CALL,,,,,,,");
        assert!(content.ends_with('\n'));
    }
}

//! Compression and expiry of past daily logs.

use crate::writer::date_from_file_name;
use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What one retention pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub compressed: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub failed: usize,
}

/// Compress past logs and delete the ones older than `retention_days`.
///
/// Today's file is never touched. Individual file failures are logged and
/// counted; only an unreadable directory fails the pass.
pub fn run(dir: &Path, today: NaiveDate, retention_days: u32) -> Result<RetentionReport, RetentionError> {
    let mut report = RetentionReport::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(source) => {
            return Err(RetentionError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date) = date_from_file_name(name) else {
            continue;
        };
        if date >= today {
            continue;
        }

        let age_days = (today - date).num_days();
        if age_days > i64::from(retention_days) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!("Deleted expired log {}", path.display());
                    report.deleted.push(path);
                }
                Err(e) => {
                    tracing::error!("Failed to delete {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        } else if name.ends_with(".csv") {
            match compress(&path) {
                Ok(gz) => {
                    tracing::info!("Compressed {} to {}", path.display(), gz.display());
                    report.compressed.push(gz);
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    report.failed += 1;
                }
            }
        }
    }

    Ok(report)
}

/// Gzip `path` to `path.gz` and remove the original.
pub fn compress(path: &Path) -> Result<PathBuf, RetentionError> {
    let mut gz_name = path.as_os_str().to_os_string();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);
    let mut tmp_name = gz_path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let write_gz = || -> io::Result<()> {
        let mut input = BufReader::new(File::open(path)?);
        let output = BufWriter::new(File::create(&tmp_path)?);
        let mut encoder = GzEncoder::new(output, Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.flush()?;
        fs::rename(&tmp_path, &gz_path)?;
        fs::remove_file(path)
    };

    write_gz().map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        RetentionError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;

    Ok(gz_path)
}

//! Command-line and environment configuration.
//!
//! Every option can be given as a flag or through its `AIRLOGGER_*`
//! environment variable; SMTP settings use the plain names shared with the
//! mail reporter.

use crate::backoff::RetryPolicy;
use crate::client::ClientConfig;
use crate::collector::CollectorConfig;
use crate::enricher::EnricherConfig;
use crate::maintenance::MaintenanceConfig;
use crate::metadata::{self, MetadataSource};
use crate::supervisor::SupervisorConfig;
use crate::tracker::TrackerConfig;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing SMTP settings: {}", .0.join(", "))]
    MissingSmtp(Vec<&'static str>),
}

/// Settings shared by the logger subcommands.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Directory for the daily CSV logs and the heartbeat
    #[arg(long, env = "AIRLOGGER_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Heartbeat file (defaults to <log-dir>/heartbeat.json)
    #[arg(long, env = "AIRLOGGER_HEARTBEAT_FILE")]
    pub heartbeat_file: Option<PathBuf>,

    /// Metadata lookup URL templates in priority order ({hex}, {hex_lower}, {hex_upper})
    #[arg(long = "metadata-url", env = "AIRLOGGER_METADATA_URLS", value_delimiter = ',')]
    pub metadata_urls: Vec<String>,

    /// Never issue metadata lookups
    #[arg(long, env = "AIRLOGGER_DISABLE_METADATA", default_value_t = false)]
    pub disable_metadata: bool,

    /// Metadata request timeout in seconds
    #[arg(long, env = "AIRLOGGER_REQUEST_TIMEOUT", default_value_t = 5)]
    pub request_timeout: u64,

    /// Metadata cache TTL in seconds
    #[arg(long, env = "AIRLOGGER_CACHE_TTL", default_value_t = 86_400)]
    pub cache_ttl: u64,

    /// Maximum cached metadata entries
    #[arg(long, env = "AIRLOGGER_CACHE_MAX_ENTRIES", default_value_t = 10_000)]
    pub cache_max_entries: usize,

    /// Persistent aircraft database (defaults to <log-dir>/aircraft_db.json)
    #[arg(long, env = "AIRLOGGER_AIRCRAFT_DB")]
    pub aircraft_db: Option<PathBuf>,

    /// Do not keep a persistent aircraft database
    #[arg(long, env = "AIRLOGGER_NO_AIRCRAFT_DB", default_value_t = false)]
    pub no_aircraft_db: bool,

    /// JSON file of callsign prefix to operator overrides
    #[arg(long, env = "AIRLOGGER_OPERATORS_FILE")]
    pub operators_file: Option<PathBuf>,

    /// Health threshold for the heartbeat age in seconds
    #[arg(long, env = "AIRLOGGER_HEALTH_THRESHOLD", default_value_t = 600)]
    pub health_threshold: u64,
}

impl Settings {
    pub fn heartbeat_path(&self) -> PathBuf {
        self.heartbeat_file
            .clone()
            .unwrap_or_else(|| self.log_dir.join("heartbeat.json"))
    }

    pub fn aircraft_db_path(&self) -> Option<PathBuf> {
        if self.no_aircraft_db {
            return None;
        }
        Some(
            self.aircraft_db
                .clone()
                .unwrap_or_else(|| self.log_dir.join("aircraft_db.json")),
        )
    }

    pub fn sources(&self) -> Vec<MetadataSource> {
        if self.metadata_urls.is_empty() {
            metadata::default_sources()
        } else {
            self.metadata_urls
                .iter()
                .map(|url| url.trim())
                .filter(|url| !url.is_empty())
                .map(MetadataSource::new)
                .collect()
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default().with_timeout(Duration::from_secs(self.request_timeout))
    }

    pub fn enricher_config(&self) -> EnricherConfig {
        EnricherConfig {
            sources: self.sources(),
            enabled: !self.disable_metadata,
            cache_ttl: Duration::from_secs(self.cache_ttl),
            cache_max_entries: self.cache_max_entries,
            ..Default::default()
        }
    }

    pub fn health_threshold(&self) -> Duration {
        Duration::from_secs(self.health_threshold)
    }
}

/// Options of the `run` subcommand.
#[derive(Args, Debug, Clone)]
pub struct RunSettings {
    /// SBS feed host
    #[arg(long, env = "AIRLOGGER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// SBS feed port
    #[arg(long, env = "AIRLOGGER_PORT", default_value_t = 30003)]
    pub port: u16,

    /// Reconnect when the feed is silent for this many seconds
    #[arg(long, env = "AIRLOGGER_IDLE_TIMEOUT", default_value_t = 30)]
    pub idle_timeout: u64,

    /// First reconnect delay in seconds
    #[arg(long, env = "AIRLOGGER_RECONNECT_INITIAL", default_value_t = 10)]
    pub reconnect_initial: u64,

    /// Longest reconnect delay in seconds
    #[arg(long, env = "AIRLOGGER_RECONNECT_MAX", default_value_t = 300)]
    pub reconnect_max: u64,

    /// Minimum seconds between two rows for one aircraft
    #[arg(long, env = "AIRLOGGER_THROTTLE", default_value_t = 60)]
    pub throttle: u64,

    /// Maximum tracked aircraft
    #[arg(long, env = "AIRLOGGER_MAX_TRACKED", default_value_t = 5_000)]
    pub max_tracked: usize,

    /// Heartbeat interval in seconds
    #[arg(long, env = "AIRLOGGER_HEARTBEAT_INTERVAL", default_value_t = 300)]
    pub heartbeat_interval: u64,

    /// Days to keep past logs
    #[arg(long, env = "AIRLOGGER_RETENTION_DAYS", default_value_t = 30)]
    pub retention_days: u32,

    /// Tracker shard workers
    #[arg(long, env = "AIRLOGGER_SHARDS", default_value_t = 4)]
    pub shards: usize,

    /// Queue depth per shard
    #[arg(long, env = "AIRLOGGER_SHARD_QUEUE", default_value_t = 1024)]
    pub shard_queue: usize,
}

impl RunSettings {
    pub fn collector_config(&self, settings: &Settings) -> CollectorConfig {
        CollectorConfig {
            supervisor: SupervisorConfig {
                host: self.host.clone(),
                port: self.port,
                idle_timeout: Duration::from_secs(self.idle_timeout.max(1)),
                reconnect: RetryPolicy::new(
                    Duration::from_secs(self.reconnect_initial),
                    Duration::from_secs(self.reconnect_max.max(self.reconnect_initial)),
                )
                .with_jitter(0.1),
                ..Default::default()
            },
            tracker: TrackerConfig {
                throttle: Duration::from_secs(self.throttle),
                max_entries: self.max_tracked,
                ..Default::default()
            },
            maintenance: MaintenanceConfig {
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval.max(1)),
                log_dir: settings.log_dir.clone(),
                heartbeat_path: settings.heartbeat_path(),
                retention_days: self.retention_days,
                ..Default::default()
            },
            shards: self.shards,
            shard_queue: self.shard_queue,
        }
    }
}

/// Mail reporter settings; only validated here.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct SmtpSettings {
    #[arg(long, env = "SMTP_SERVER")]
    pub smtp_server: Option<String>,

    #[arg(long, env = "SMTP_PORT", default_value_t = 587)]
    pub smtp_port: u16,

    #[arg(long, env = "EMAIL_USER")]
    pub email_user: Option<String>,

    #[arg(long, env = "EMAIL_PASSWORD", hide_env_values = true)]
    pub email_password: Option<String>,

    /// Sender address (defaults to the SMTP user)
    #[arg(long, env = "EMAIL_FROM")]
    pub email_from: Option<String>,

    #[arg(long, env = "EMAIL_TO")]
    pub email_to: Option<String>,
}

impl SmtpSettings {
    /// Names of the required settings that are unset or blank.
    pub fn missing(&self) -> Vec<&'static str> {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        [
            ("SMTP_SERVER", &self.smtp_server),
            ("EMAIL_USER", &self.email_user),
            ("EMAIL_PASSWORD", &self.email_password),
            ("EMAIL_TO", &self.email_to),
        ]
        .into_iter()
        .filter(|&(_, v)| blank(v))
        .map(|(name, _)| name)
        .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingSmtp(missing))
        }
    }

    pub fn sender(&self) -> Option<&str> {
        self.email_from.as_deref().or(self.email_user.as_deref())
    }
}

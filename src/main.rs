//! SBS-1 aircraft logger CLI
//!
//! Reads a BaseStation feed, enriches aircraft with registration, model and
//! operator, and writes one CSV log per UTC day.

use airlogger::{
    aircraft_db::AircraftDb,
    client::HttpClient,
    clock::{Clock, SharedClock, SystemClock},
    collector::Collector,
    config::{RunSettings, Settings, SmtpSettings},
    enricher::Enricher,
    operators::OperatorDirectory,
    protocol, status,
    writer::LogWriter,
};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "airlogger")]
#[command(about = "SBS-1 aircraft logger with metadata enrichment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    settings: Settings,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "AIRLOGGER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the feed and log aircraft continuously
    Run {
        #[command(flatten)]
        run: RunSettings,
    },

    /// Summarize today's log and check the heartbeat; exits 1 when unhealthy
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        smtp: SmtpSettings,
    },

    /// Look up metadata for one aircraft
    Lookup {
        /// ICAO hex address, e.g. "4CA87C"
        hex: String,
    },

    /// Parse a captured SBS feed file (for testing)
    Parse {
        /// Path to a file of feed lines
        file: PathBuf,

        /// Print the first N observations
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run { run } => {
            run_logger(&cli.settings, &run).await?;
        }

        Commands::Status { json, smtp } => {
            let healthy = show_status(&cli.settings, &smtp, json)?;
            if !healthy {
                std::process::exit(1);
            }
        }

        Commands::Lookup { hex } => {
            lookup_hex(&cli.settings, &hex).await?;
        }

        Commands::Parse { file, limit } => {
            parse_file(&file, limit)?;
        }
    }

    Ok(())
}

fn build_enricher(settings: &Settings, clock: SharedClock) -> Result<Arc<Enricher>, Box<dyn std::error::Error>> {
    let client = HttpClient::new(settings.client_config())?;
    let directory = OperatorDirectory::new(settings.operators_file.clone());
    let mut enricher = Enricher::new(
        Arc::new(client),
        Arc::new(directory),
        clock,
        settings.enricher_config(),
    );
    if let Some(path) = settings.aircraft_db_path() {
        enricher = enricher.with_store(Arc::new(AircraftDb::open(path)));
    }
    Ok(Arc::new(enricher))
}

async fn run_logger(settings: &Settings, run: &RunSettings) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting aircraft logger");
    tracing::info!("Feed: {}:{}", run.host, run.port);
    tracing::info!("Log directory: {}", settings.log_dir.display());
    if let Some(path) = settings.aircraft_db_path() {
        tracing::info!("Aircraft database: {}", path.display());
    }
    if settings.disable_metadata {
        tracing::info!("Metadata lookups disabled");
    } else {
        for source in settings.sources() {
            tracing::info!("Metadata source: {}", source.template());
        }
    }

    let clock: SharedClock = Arc::new(SystemClock);
    let enricher = build_enricher(settings, Arc::clone(&clock))?;
    let writer = Arc::new(LogWriter::new(&settings.log_dir));

    let collector = Arc::new(Collector::new(
        run.collector_config(settings),
        Arc::clone(&enricher),
        writer,
        clock,
    ));
    let stats = collector.stats();

    // Spawn stats reporting task
    let stats_handle = {
        let stats = Arc::clone(&stats);
        let enricher = Arc::clone(&enricher);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let s = stats.snapshot();
                let e = enricher.stats();
                tracing::info!(
                    "Stats: lines={}, observations={}, parse_errors={}, rows={}, write_errors={}, cache={}, lookups={}, requests={}",
                    s.lines,
                    s.observations,
                    s.parse_errors,
                    s.rows_written,
                    s.write_errors,
                    enricher.cache().len(),
                    e.lookups.load(std::sync::atomic::Ordering::Relaxed),
                    e.requests.load(std::sync::atomic::Ordering::Relaxed),
                );
            }
        })
    };

    let mut collector_handle = {
        let collector = Arc::clone(&collector);
        tokio::spawn(async move { collector.run().await })
    };

    // Handle Ctrl+C
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
            None
        }
        result = &mut collector_handle => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            collector.stop();
            collector_handle.await
        }
    };

    stats_handle.abort();

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Collector error: {}", e),
        Err(e) => tracing::error!("Collector task failed: {}", e),
    }

    let final_stats = stats.snapshot();
    tracing::info!("Final statistics:");
    tracing::info!("  Lines read: {}", final_stats.lines);
    tracing::info!("  Observations: {}", final_stats.observations);
    tracing::info!("  Malformed lines: {}", final_stats.parse_errors);
    tracing::info!("  Rows written: {}", final_stats.rows_written);
    tracing::info!("  Write errors: {}", final_stats.write_errors);
    tracing::info!("  Failed observations: {}", final_stats.failed);
    tracing::info!("  Cached aircraft: {}", enricher.cache().len());

    Ok(())
}

fn show_status(settings: &Settings, smtp: &SmtpSettings, json: bool) -> Result<bool, Box<dyn std::error::Error>> {
    let report = status::report(
        &settings.log_dir,
        &settings.heartbeat_path(),
        SystemClock.now(),
        settings.health_threshold(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.health.healthy);
    }

    let summary = &report.summary;
    println!("Aircraft Log Status ({})", summary.date);
    println!("=================================");
    println!("Rows today: {}", summary.total_rows);
    println!("Unique aircraft: {}", summary.unique_aircraft);

    if !summary.top_operators.is_empty() {
        println!();
        println!("Top operators:");
        for (operator, count) in &summary.top_operators {
            println!("  {:<32} {}", operator, count);
        }
    }

    if let Some(latest) = &summary.latest {
        println!();
        println!("Most recent row:");
        for (column, value) in latest.iter().filter(|(_, v)| !v.is_empty()) {
            println!("  {}: {}", column, value);
        }
    }

    let health = &report.health;
    println!();
    match (&health.heartbeat, health.age_seconds) {
        (Some(hb), Some(age)) => {
            println!("Heartbeat: {} ({:.0}s ago, pid {})", hb.iso, age, hb.pid);
            println!("  Processed since previous: {}", hb.processed_since_last);
            println!("  Metadata cache size: {}", hb.cache_size);
        }
        (Some(hb), None) => println!("Heartbeat: {} (unusable timestamp)", hb.iso),
        (None, _) => println!("Heartbeat: missing"),
    }
    println!(
        "Health: {} (threshold {}s)",
        if health.healthy { "OK" } else { "STALE" },
        health.threshold_seconds
    );

    match smtp.validate() {
        Ok(()) => println!("Mail reports: configured"),
        Err(e) => println!("Mail reports: {}", e),
    }

    Ok(health.healthy)
}

async fn lookup_hex(settings: &Settings, hex: &str) -> Result<(), Box<dyn std::error::Error>> {
    let hex = hex.trim();
    if hex.is_empty() || u32::from_str_radix(hex, 16).is_err() {
        return Err(format!("Invalid ICAO hex: {:?}", hex).into());
    }

    tracing::info!("Looking up ICAO: {}", hex.to_ascii_uppercase());

    let enricher = build_enricher(settings, Arc::new(SystemClock))?;
    let meta = enricher.resolve(hex).await;
    if let Err(e) = enricher.persist() {
        tracing::warn!("Failed to save aircraft database: {}", e);
    }

    if meta.is_empty() {
        println!("No metadata found for {}", hex.to_ascii_uppercase());
        return Ok(());
    }

    let operator = if meta.operator.is_empty() {
        enricher.operator_for_callsign(&meta.callsign).unwrap_or_default()
    } else {
        meta.operator.clone()
    };

    println!("Aircraft {}", hex.to_ascii_uppercase());
    println!("  Registration: {}", meta.registration);
    println!("  Model: {}", meta.model);
    println!("  Operator: {}", operator);
    if !meta.callsign.is_empty() {
        println!("  Callsign: {}", meta.callsign);
    }

    Ok(())
}

fn parse_file(path: &Path, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;

    tracing::info!("Parsing file: {} ({} bytes)", path.display(), data.len());

    let text = String::from_utf8_lossy(&data);
    let mut parsed = 0usize;
    let mut rejected = 0usize;
    let mut hexes = HashSet::new();
    let mut shown = Vec::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match protocol::parse_message(line) {
            Ok(obs) => {
                parsed += 1;
                hexes.insert(obs.hex.clone());
                if shown.len() < limit {
                    shown.push(obs);
                }
            }
            Err(e) => {
                rejected += 1;
                tracing::debug!("Rejected line: {}", e);
            }
        }
    }

    println!("Lines parsed: {}", parsed);
    println!("Lines rejected: {}", rejected);
    println!("Unique aircraft: {}", hexes.len());
    println!();

    for obs in shown {
        println!("{}", obs.hex);
        if !obs.callsign.is_empty() {
            println!("  Callsign: {}", obs.callsign);
        }
        if !obs.altitude.is_empty() {
            println!("  Altitude: {} ft", obs.altitude);
        }
        if !obs.speed.is_empty() {
            println!("  Speed: {} kt", obs.speed);
        }
        if !obs.latitude.is_empty() || !obs.longitude.is_empty() {
            println!("  Position: {}, {}", obs.latitude, obs.longitude);
        }
    }

    Ok(())
}

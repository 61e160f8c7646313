use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use faultline::analysis::baseline::BaselineCalculator;
use faultline::analysis::cascade::CascadeDetector;
use faultline::analysis::correlation::CorrelationEngine;
use faultline::analysis::lookback_from;
use faultline::analysis::patterns::PatternDetector;
use faultline::config::{FaultlineConfig, LoggingConfig};
use faultline::detect::alert::OutboxSink;
use faultline::detect::engine::AnomalyEngine;
use faultline::detect::throttle::AlertThrottler;
use faultline::fingerprint::FrameFilter;
use faultline::occurrence::IdentityId;
use faultline::similarity::SimilarityScorer;
use faultline::storage::{outbox, CascadeRepository};

#[derive(Parser)]
#[command(
    name = "faultline",
    about = "Error-telemetry analytics: anomalies, cascades, bursts and near-duplicates",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, global = true, env = "FAULTLINE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load raw occurrences from a JSON-lines file
    Ingest {
        /// One occurrence object per line
        #[arg(long)]
        file: PathBuf,
    },

    /// Recompute every baseline now
    Baselines,

    /// Run one anomaly scan; alerts go to the outbox
    ///
    /// The alert cooldown only lives for this one invocation, so scheduling
    /// `scan` repeatedly (e.g. from cron) alerts again on every run while an
    /// anomaly lasts. Use `faultline run` for throttled, periodic scans.
    Scan {
        /// Standard deviations above the mean that count as anomalous
        #[arg(long)]
        sensitivity: Option<f64>,
    },

    /// Run one cascade detection pass
    Cascades {
        /// How far back to look
        #[arg(long)]
        lookback_hours: Option<i64>,

        /// How many stored patterns to print afterwards
        #[arg(long, default_value = "20")]
        top: usize,
    },

    /// Cyclical pattern and bursts of one identity
    Patterns {
        #[arg(long)]
        identity: i64,

        #[arg(long, default_value = "30")]
        days: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Identities that look like near-duplicates of another
    Similar {
        #[arg(long)]
        identity: i64,

        #[arg(long, default_value = "0.8")]
        threshold: f64,

        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Identities whose hourly counts move together
    Correlations {
        #[arg(long, default_value = "168")]
        hours: i64,

        /// Minimum Pearson coefficient
        #[arg(long, default_value = "0.7")]
        min: f64,
    },

    /// List undispatched alerts in the outbox
    Alerts {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Start the daemon (periodic scans, baselines and cascade detection)
    Run,
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<FaultlineConfig> {
    let mut config = match &cli.config {
        Some(path) => FaultlineConfig::load(path)?,
        None => FaultlineConfig::load_or_default(),
    };
    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run => {
            tracing::info!(db = %config.storage.db_path.display(), "Starting faultline daemon");
            faultline::run(config).await?;
        }
        Commands::Ingest { file } => {
            let (_, store) = faultline::open_store(&config)?;
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("failed to open {}", file.display()))?,
            );
            let report = faultline::ingest::ingest_jsonl(&store, reader)?;
            println!("ingested {} occurrences, rejected {}", report.accepted, report.rejected);
        }
        Commands::Baselines => {
            let (_, store) = faultline::open_store(&config)?;
            let report = BaselineCalculator::new(store).calculate_all(Utc::now())?;
            println!(
                "baselines: {} keys updated, {} failed, {} skipped",
                report.succeeded, report.failed, report.skipped
            );
        }
        Commands::Scan { sensitivity } => {
            if let Some(s) = sensitivity {
                config.anomaly.sensitivity = s;
            }
            let (pool, store) = faultline::open_store(&config)?;
            let engine = AnomalyEngine::new(
                store,
                OutboxSink::new(pool),
                Arc::new(AlertThrottler::new()),
                config.anomaly.clone(),
            );
            let summary = engine.run_scan(Utc::now())?;
            print_json(&summary)?;
        }
        Commands::Cascades {
            lookback_hours,
            top,
        } => {
            let (_, store) = faultline::open_store(&config)?;
            let lookback = lookback_hours.unwrap_or(config.cascade.lookback_hours);
            let detector = CascadeDetector::new(store.clone(), config.cascade.clone());
            let summary = detector.detect_cascades(lookback, Utc::now())?;
            println!(
                "cascades: {} detected, {} updated, {} failed",
                summary.detected, summary.updated, summary.failed
            );

            let patterns = store.list_cascade_patterns(top)?;
            if !patterns.is_empty() {
                println!("\n{:<10} | {:<10} | {:>9} | {:>9} | Probability", "Parent", "Child", "Frequency", "Avg delay");
                println!("{:-<10}-|-{:-<10}-|-{:->9}-|-{:->9}-|-{:-<11}", "", "", "", "", "");
                for p in patterns {
                    let probability = p
                        .cascade_probability
                        .map(|v| format!("{v:.3}"))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<10} | {:<10} | {:>9} | {:>8.1}s | {}",
                        p.parent_identity_id.0, p.child_identity_id.0, p.frequency, p.avg_delay_seconds, probability
                    );
                }
            }
        }
        Commands::Patterns {
            identity,
            days,
            json,
        } => {
            let (_, store) = faultline::open_store(&config)?;
            let detector = PatternDetector::new(store, config.bursts.clone());
            let report = detector.analyze(IdentityId(identity), days, Utc::now())?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "identity {}: {} occurrences in the last {} days",
                    report.identity_id, report.occurrences, report.days
                );
                println!(
                    "pattern: {:?} (strength {:.2}), peak hours {:?}",
                    report.cyclical.pattern_type, report.cyclical.strength, report.cyclical.peak_hours
                );
                for b in &report.bursts {
                    println!(
                        "burst {} .. {}: {} errors in {}s ({:?})",
                        b.start.to_rfc3339(),
                        b.end.to_rfc3339(),
                        b.error_count,
                        b.duration_seconds,
                        b.intensity
                    );
                }
            }
        }
        Commands::Similar {
            identity,
            threshold,
            limit,
        } => {
            let (_, store) = faultline::open_store(&config)?;
            let scorer = SimilarityScorer::new(FrameFilter::new(&config.frames));
            let matches = scorer.find_similar(&store, IdentityId(identity), threshold, limit)?;
            print_json(&matches)?;
        }
        Commands::Correlations { hours, min } => {
            let (_, store) = faultline::open_store(&config)?;
            let since = lookback_from(Utc::now(), hours, Duration::try_hours, "hours")?;
            let pairs = CorrelationEngine::new(store).correlate(since, min)?;
            print_json(&pairs)?;
        }
        Commands::Alerts { limit } => {
            let (pool, _) = faultline::open_store(&config)?;
            let conn = pool.get()?;
            let alerts = outbox::pending(&conn, limit)?;
            print_json(&alerts)?;
        }
    }

    Ok(())
}

//! Faultline -- error-telemetry analytics.
//!
//! This crate groups raw exception occurrences into identities and learns what
//! normal looks like for each error type. From that it detects anomalous
//! spikes, cascades between identities, bursts and near-duplicate errors.

pub mod analysis;
pub mod config;
pub mod detect;
pub mod fingerprint;
pub mod ingest;
pub mod occurrence;
pub mod similarity;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::analysis::baseline::BaselineCalculator;
use crate::analysis::cascade::CascadeDetector;
use crate::config::FaultlineConfig;
use crate::detect::alert::OutboxSink;
use crate::detect::engine::AnomalyEngine;
use crate::detect::throttle::AlertThrottler;
use crate::fingerprint::FrameFilter;
use crate::storage::{Pool, SqliteStore};

/// Open the configured database, creating its directory if needed.
pub fn open_store(config: &FaultlineConfig) -> Result<(Pool, SqliteStore)> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    let store = SqliteStore::new(pool.clone()).with_frame_filter(FrameFilter::new(&config.frames));
    Ok((pool, store))
}

/// Run `job` on the blocking pool every `every`, one run at a time.
fn spawn_periodic<F>(name: &'static str, every: Duration, job: F) -> JoinHandle<()>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    let job = Arc::new(job);
    tokio::spawn(async move {
        info!(task = name, interval_secs = every.as_secs(), "periodic task started");
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let job = Arc::clone(&job);
            match tokio::task::spawn_blocking(move || job()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = name, error = %e, "periodic task failed"),
                Err(e) => error!(task = name, error = %e, "periodic task aborted"),
            }
        }
    })
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

/// Start the faultline daemon: anomaly scans, baseline refreshes and cascade
/// detection on their own intervals until Ctrl-C.
pub async fn run(config: FaultlineConfig) -> Result<()> {
    let (pool, store) = open_store(&config)?;

    let throttler = Arc::new(AlertThrottler::new());
    let engine = Arc::new(AnomalyEngine::new(
        store.clone(),
        OutboxSink::new(pool),
        Arc::clone(&throttler),
        config.anomaly.clone(),
    ));
    let baselines = Arc::new(BaselineCalculator::new(store.clone()));
    let cascades = Arc::new(CascadeDetector::new(store, config.cascade.clone()));

    let retention = config.anomaly.throttle_retention();
    let lookback_hours = config.cascade.lookback_hours;
    let daemon = &config.daemon;

    let tasks = vec![
        spawn_periodic("baselines", secs(daemon.baseline_interval_secs), move || {
            baselines.calculate_all(Utc::now())?;
            Ok(())
        }),
        spawn_periodic("anomaly_scan", secs(daemon.scan_interval_secs), move || {
            engine.run_scan(Utc::now())?;
            engine.throttler().sweep(retention);
            Ok(())
        }),
        spawn_periodic("cascades", secs(daemon.cascade_interval_secs), move || {
            cascades.detect_cascades(lookback_hours, Utc::now())?;
            Ok(())
        }),
    ];

    info!("faultline daemon running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

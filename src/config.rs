//! TOML configuration for Faultline.
//!
//! Every section has compiled-in defaults, so a partial (or empty) file is
//! valid. The analytics components never read this file themselves: the
//! binary loads it and hands each component its own section.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultlineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    #[serde(default)]
    pub bursts: BurstConfig,
    #[serde(default)]
    pub frames: FrameConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FaultlineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded faultline configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `FAULTLINE_CONFIG` environment variable.
    /// 2. `/etc/faultline/faultline.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("FAULTLINE_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FAULTLINE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/faultline/faultline.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Location of the SQLite database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/faultline.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Anomaly detection
// ---------------------------------------------------------------------------

/// Anomaly evaluation and alert throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Number of standard deviations above the mean that counts as anomalous.
    pub sensitivity: f64,
    /// Minimum time between two alerts for the same (error_type, platform).
    pub cooldown_minutes: i64,
    /// Throttle entries older than this are evicted by the periodic sweep.
    pub throttle_retention_hours: i64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            sensitivity: 2.0,
            cooldown_minutes: 120,
            throttle_retention_hours: 24,
        }
    }
}

impl AnomalyConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes)
    }

    pub fn throttle_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.throttle_retention_hours)
    }
}

// ---------------------------------------------------------------------------
// Cascades
// ---------------------------------------------------------------------------

/// Cascade (follow-on error) detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// A child must follow its parent within this many seconds.
    pub window_seconds: i64,
    /// Pairs seen fewer times than this in one run are ignored.
    pub min_frequency: u64,
    /// How far back a detection run looks.
    pub lookback_hours: i64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            min_frequency: 3,
            lookback_hours: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// Bursts
// ---------------------------------------------------------------------------

/// Burst detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    /// Maximum inter-arrival gap inside a burst.
    pub max_gap_seconds: i64,
    /// Minimum number of occurrences for a run to be reported.
    pub min_size: usize,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            max_gap_seconds: 60,
            min_size: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Backtrace frames
// ---------------------------------------------------------------------------

/// Which backtrace frames count as application code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Frames whose path contains any of these fragments are dependency or
    /// runtime frames and are skipped.
    pub excluded_path_fragments: Vec<String>,
    /// Everything before the first of these directories is stripped from a path.
    pub project_dirs: Vec<String>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        let excluded = [
            "/gems/",
            "/vendor/",
            "/bundle/",
            "/rubygems",
            "/lib/ruby/",
            "<internal:",
            "/node_modules/",
            "node:internal",
            "/site-packages/",
            "/dist-packages/",
            "/lib/python",
            "/.cargo/registry/",
            "/rustc/",
            "/usr/lib/",
            "/usr/local/lib/",
        ];
        let project = ["app/", "lib/", "src/", "config/", "db/", "spec/", "test/"];
        Self {
            excluded_path_fragments: excluded.iter().map(|s| s.to_string()).collect(),
            project_dirs: project.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Periods of the batch loops run by `faultline run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub scan_interval_secs: u64,
    pub baseline_interval_secs: u64,
    pub cascade_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            baseline_interval_secs: 3600,
            cascade_interval_secs: 900,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = FaultlineConfig::default();

        assert_eq!(cfg.storage.db_path, PathBuf::from("data/faultline.db"));

        assert_eq!(cfg.anomaly.sensitivity, 2.0);
        assert_eq!(cfg.anomaly.cooldown(), chrono::Duration::minutes(120));
        assert_eq!(cfg.anomaly.throttle_retention_hours, 24);

        assert_eq!(cfg.cascade.window_seconds, 60);
        assert_eq!(cfg.cascade.min_frequency, 3);

        assert_eq!(cfg.bursts.max_gap_seconds, 60);
        assert_eq!(cfg.bursts.min_size, 5);

        assert!(cfg.frames.excluded_path_fragments.iter().any(|f| f == "/gems/"));
        assert!(cfg.frames.project_dirs.iter().any(|d| d == "app/"));

        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[storage]
db_path = "/var/lib/faultline/errors.db"

[anomaly]
sensitivity = 3.5
cooldown_minutes = 30
throttle_retention_hours = 6

[cascade]
window_seconds = 120
min_frequency = 5
lookback_hours = 48

[bursts]
max_gap_seconds = 30
min_size = 8

[frames]
excluded_path_fragments = ["/deps/"]
project_dirs = ["pkg/"]

[daemon]
scan_interval_secs = 30

[logging]
level = "debug"
json = true
"#;

        let cfg: FaultlineConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.storage.db_path, PathBuf::from("/var/lib/faultline/errors.db"));
        assert_eq!(cfg.anomaly.sensitivity, 3.5);
        assert_eq!(cfg.anomaly.cooldown_minutes, 30);
        assert_eq!(cfg.anomaly.throttle_retention(), chrono::Duration::hours(6));
        assert_eq!(cfg.cascade.window_seconds, 120);
        assert_eq!(cfg.cascade.min_frequency, 5);
        assert_eq!(cfg.cascade.lookback_hours, 48);
        assert_eq!(cfg.bursts.max_gap_seconds, 30);
        assert_eq!(cfg.bursts.min_size, 8);
        assert_eq!(cfg.frames.excluded_path_fragments, vec!["/deps/".to_string()]);
        assert_eq!(cfg.frames.project_dirs, vec!["pkg/".to_string()]);
        assert_eq!(cfg.daemon.scan_interval_secs, 30);
        assert_eq!(cfg.daemon.baseline_interval_secs, 3600);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[anomaly]
sensitivity = 1.5
"#;

        let cfg: FaultlineConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.anomaly.sensitivity, 1.5);
        assert_eq!(cfg.anomaly.cooldown_minutes, 120);
        assert_eq!(cfg.cascade.min_frequency, 3);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: FaultlineConfig = toml::from_str("").unwrap();
        let defaults = FaultlineConfig::default();

        assert_eq!(cfg.storage.db_path, defaults.storage.db_path);
        assert_eq!(cfg.bursts.min_size, defaults.bursts.min_size);
        assert_eq!(
            cfg.frames.excluded_path_fragments,
            defaults.frames.excluded_path_fragments
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("faultline.toml");
        std::fs::write(
            &path,
            r#"
[cascade]
window_seconds = 90
"#,
        )
        .unwrap();

        let cfg = FaultlineConfig::load(&path).unwrap();
        assert_eq!(cfg.cascade.window_seconds, 90);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = FaultlineConfig::load(Path::new("/nonexistent/path/faultline.toml"));
        assert!(result.is_err());
    }
}

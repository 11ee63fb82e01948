//! Configuration for query limits and discovery windows
//!
//! Supports TOML files with serde defaults and environment variable
//! overrides, mirroring how the rest of the deployment is configured.

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

/// Default maximum number of data points per time series
pub const MAX_POINTS: usize = 10_000;

/// Query engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Maximum number of data points per time series
    #[serde(default = "default_max_points")]
    pub max_points: usize,

    /// Minimum rollup interval in seconds
    #[serde(default = "default_min_rollup_secs")]
    pub min_rollup_secs: u64,

    /// Default stats period when neither `statsPeriod` nor `start`/`end`
    /// are given (duration shorthand, e.g. "1d")
    #[serde(default = "default_stats_period")]
    pub default_stats_period: String,

    /// Default rollup interval when `interval` is not given
    /// (duration shorthand, e.g. "1h")
    #[serde(default = "default_interval")]
    pub default_interval: String,

    /// How far back metadata discovery samples raw data, in hours
    #[serde(default = "default_meta_lookback_hours")]
    pub meta_lookback_hours: i64,
}

fn default_max_points() -> usize {
    MAX_POINTS
}
fn default_min_rollup_secs() -> u64 {
    10
}
fn default_stats_period() -> String {
    "1d".to_string()
}
fn default_interval() -> String {
    "1h".to_string()
}
fn default_meta_lookback_hours() -> i64 {
    24
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_points: default_max_points(),
            min_rollup_secs: default_min_rollup_secs(),
            default_stats_period: default_stats_period(),
            default_interval: default_interval(),
            meta_lookback_hours: default_meta_lookback_hours(),
        }
    }
}

impl QueryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            QueryError::Configuration(format!("Failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            QueryError::Configuration(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KUBA_METRICS_MAX_POINTS") {
            if let Ok(p) = v.parse() {
                self.max_points = p;
            }
        }
        if let Ok(v) = std::env::var("KUBA_METRICS_MIN_ROLLUP_SECS") {
            if let Ok(p) = v.parse() {
                self.min_rollup_secs = p;
            }
        }
        if let Ok(v) = std::env::var("KUBA_METRICS_STATS_PERIOD") {
            self.default_stats_period = v;
        }
        if let Ok(v) = std::env::var("KUBA_METRICS_INTERVAL") {
            self.default_interval = v;
        }
        if let Ok(v) = std::env::var("KUBA_METRICS_META_LOOKBACK_HOURS") {
            if let Ok(p) = v.parse() {
                self.meta_lookback_hours = p;
            }
        }
    }
}

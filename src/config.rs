use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::persist::path_guard::{PathGuard, PathGuardError};

/// Hard cap on per-metric anomaly history
pub const MAX_ANOMALY_HISTORY: usize = 100;

/// Anomaly detection never evaluates with fewer points than this
pub const MIN_ANOMALY_DATA_POINTS: usize = 3;

/// Longest retention window accepted, in minutes (one year)
pub const MAX_RETENTION_MINUTES: u64 = 525_600;

/// Longest dynamic threshold update interval accepted, in seconds (one week)
pub const MAX_DYNAMIC_INTERVAL_SECS: u64 = 604_800;

/// File name used when no explicit storage path is configured
pub const DEFAULT_STATE_FILE: &str = "filter_state.json";

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
        }
    }
}

/// Filtering rules. Metric maps are keyed by metric name.
#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default)]
    pub thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    #[serde(default)]
    pub min_thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub max_thresholds: HashMap<String, f64>,

    #[serde(default)]
    pub dynamic_thresholds_enabled: bool,
    #[serde(default = "default_dynamic_interval")]
    pub dynamic_update_interval_secs: u64,
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,

    #[serde(default)]
    pub multi_metric_enabled: bool,
    #[serde(default = "default_composite_threshold")]
    pub composite_threshold: f64,

    #[serde(default)]
    pub anomaly_detection_enabled: bool,
    #[serde(default = "default_anomaly_history")]
    pub anomaly_history_size: usize,
    #[serde(default = "default_anomaly_change")]
    pub anomaly_change_threshold: f64,
    #[serde(default = "default_anomaly_min_points")]
    pub anomaly_min_data_points: usize,

    #[serde(default)]
    pub include_list: Vec<String>,
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,
    #[serde(default)]
    pub anomaly_retention_minutes: Option<u64>,

    #[serde(default)]
    pub debug_all_stages: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            thresholds: HashMap::new(),
            weights: HashMap::new(),
            min_thresholds: HashMap::new(),
            max_thresholds: HashMap::new(),
            dynamic_thresholds_enabled: false,
            dynamic_update_interval_secs: default_dynamic_interval(),
            smoothing_factor: default_smoothing_factor(),
            multi_metric_enabled: false,
            composite_threshold: default_composite_threshold(),
            anomaly_detection_enabled: false,
            anomaly_history_size: default_anomaly_history(),
            anomaly_change_threshold: default_anomaly_change(),
            anomaly_min_data_points: default_anomaly_min_points(),
            include_list: vec![],
            retention_minutes: default_retention_minutes(),
            anomaly_retention_minutes: None,
            debug_all_stages: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub enabled: bool,
    pub path: Option<String>,
}

/// Invalid configuration detected at construction
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field}: negative value {value} for metric {metric}")]
    NegativeValue {
        field: &'static str,
        metric: String,
        value: f64,
    },

    #[error("min_thresholds/max_thresholds: min {min} exceeds max {max} for metric {metric}")]
    InvertedBounds { metric: String, min: f64, max: f64 },

    #[error("{field}: must be positive when {feature} is enabled (got {value})")]
    NonPositive {
        field: &'static str,
        feature: &'static str,
        value: f64,
    },

    #[error("storage.path: {0}")]
    Storage(#[from] PathGuardError),
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        // Expand environment variables
        let expanded = expand_env_vars(&content)?;

        let config: Config =
            toml::from_str(&expanded).with_context(|| "Failed to parse configuration")?;

        config.filter.validate()?;
        if config.storage.enabled {
            config.storage.resolve_path(&PathGuard::platform_default())?;
        }

        Ok(config)
    }
}

impl FilterConfig {
    /// Reject clearly invalid values. Everything else is normalized.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, map) in [
            ("thresholds", &self.thresholds),
            ("weights", &self.weights),
            ("min_thresholds", &self.min_thresholds),
            ("max_thresholds", &self.max_thresholds),
        ] {
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let value = map[name];
                if value < 0.0 {
                    return Err(ConfigError::NegativeValue {
                        field,
                        metric: name.clone(),
                        value,
                    });
                }
            }
        }

        for (metric, &min) in &self.min_thresholds {
            if let Some(&max) = self.max_thresholds.get(metric) {
                if min > max {
                    return Err(ConfigError::InvertedBounds {
                        metric: metric.clone(),
                        min,
                        max,
                    });
                }
            }
        }

        if self.anomaly_detection_enabled {
            if self.anomaly_history_size == 0 {
                return Err(ConfigError::NonPositive {
                    field: "anomaly_history_size",
                    feature: "anomaly detection",
                    value: 0.0,
                });
            }
            if self.anomaly_min_data_points == 0 {
                return Err(ConfigError::NonPositive {
                    field: "anomaly_min_data_points",
                    feature: "anomaly detection",
                    value: 0.0,
                });
            }
            if self.anomaly_change_threshold <= 0.0 {
                return Err(ConfigError::NonPositive {
                    field: "anomaly_change_threshold",
                    feature: "anomaly detection",
                    value: self.anomaly_change_threshold,
                });
            }
        }

        if self.multi_metric_enabled && self.composite_threshold <= 0.0 {
            return Err(ConfigError::NonPositive {
                field: "composite_threshold",
                feature: "multi-metric scoring",
                value: self.composite_threshold,
            });
        }

        Ok(())
    }

    /// Apply defaults and caps to numeric fields
    pub fn normalized(&self) -> FilterConfig {
        let mut cfg = self.clone();

        if !(cfg.smoothing_factor > 0.0 && cfg.smoothing_factor <= 1.0) {
            tracing::warn!(
                value = cfg.smoothing_factor,
                "smoothing_factor outside (0, 1], using default"
            );
            cfg.smoothing_factor = default_smoothing_factor();
        }

        if cfg.dynamic_update_interval_secs == 0 {
            cfg.dynamic_update_interval_secs = default_dynamic_interval();
        }
        cfg.dynamic_update_interval_secs = capped(
            "dynamic_update_interval_secs",
            cfg.dynamic_update_interval_secs,
            MAX_DYNAMIC_INTERVAL_SECS,
        );

        cfg.retention_minutes = capped("retention_minutes", cfg.retention_minutes, MAX_RETENTION_MINUTES);
        cfg.anomaly_retention_minutes = cfg
            .anomaly_retention_minutes
            .map(|m| capped("anomaly_retention_minutes", m, MAX_RETENTION_MINUTES));

        if cfg.composite_threshold <= 0.0 {
            cfg.composite_threshold = default_composite_threshold();
        }
        if cfg.anomaly_change_threshold <= 0.0 {
            cfg.anomaly_change_threshold = default_anomaly_change();
        }

        if cfg.anomaly_min_data_points < MIN_ANOMALY_DATA_POINTS {
            if cfg.anomaly_detection_enabled {
                tracing::warn!(
                    configured = cfg.anomaly_min_data_points,
                    minimum = MIN_ANOMALY_DATA_POINTS,
                    "anomaly_min_data_points raised to minimum"
                );
            }
            cfg.anomaly_min_data_points = MIN_ANOMALY_DATA_POINTS;
        }
        cfg.anomaly_min_data_points = cfg.anomaly_min_data_points.min(MAX_ANOMALY_HISTORY);

        if cfg.anomaly_history_size == 0 {
            cfg.anomaly_history_size = default_anomaly_history();
        }
        cfg.anomaly_history_size = cfg
            .anomaly_history_size
            .max(cfg.anomaly_min_data_points)
            .min(MAX_ANOMALY_HISTORY);

        for entry in &cfg.include_list {
            if !is_path_entry(entry) {
                tracing::warn!(
                    entry = %entry,
                    "include_list entry has no path separator and will never match"
                );
            }
        }

        cfg
    }

    /// Standard retention window
    pub fn retention_window(&self) -> Duration {
        minutes_window(self.retention_minutes)
    }

    /// Anomaly retention window, falling back to the standard one
    pub fn anomaly_retention_window(&self) -> Duration {
        minutes_window(
            self.anomaly_retention_minutes
                .unwrap_or(self.retention_minutes),
        )
    }

    /// A metric is targeted when it has a static threshold or a composite weight
    pub fn is_targeted(&self, metric: &str) -> bool {
        self.thresholds.contains_key(metric) || self.weights.contains_key(metric)
    }
}

impl StorageConfig {
    /// Resolve the state file path and check it against the guard
    pub fn resolve_path(&self, guard: &PathGuard) -> Result<PathBuf, ConfigError> {
        let path = match &self.path {
            Some(p) => PathBuf::from(p),
            None => guard.base().join(DEFAULT_STATE_FILE),
        };
        Ok(guard.check(&path)?)
    }
}

fn capped(field: &str, value: u64, max: u64) -> u64 {
    if value > max {
        tracing::warn!(field, configured = value, maximum = max, "value capped to maximum");
        return max;
    }
    value
}

/// Window of `minutes`, saturating at the retention cap
fn minutes_window(minutes: u64) -> Duration {
    let minutes = minutes.min(MAX_RETENTION_MINUTES) as i64;
    Duration::try_minutes(minutes).unwrap_or(Duration::zero())
}

/// Include-list entries must carry a path separator to ever match
pub fn is_path_entry(entry: &str) -> bool {
    entry.contains('/') || entry.contains('\\')
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .to_string())
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_dynamic_interval() -> u64 { 300 }
fn default_smoothing_factor() -> f64 { 0.2 }
fn default_composite_threshold() -> f64 { 1.0 }
fn default_anomaly_history() -> usize { 10 }
fn default_anomaly_change() -> f64 { 200.0 }
fn default_anomaly_min_points() -> usize { MIN_ANOMALY_DATA_POINTS }
fn default_retention_minutes() -> u64 { 5 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filter_section_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [filter]
            thresholds = { cpu = 80.0, "process.memory.usage" = 0.0 }
            weights = { cpu = 0.6 }
            "#,
        )
        .unwrap();

        assert_eq!(cfg.filter.thresholds["cpu"], 80.0);
        assert_eq!(cfg.filter.smoothing_factor, 0.2);
        assert_eq!(cfg.filter.anomaly_history_size, 10);
        assert_eq!(cfg.filter.retention_minutes, 5);
        assert!(!cfg.storage.enabled);
        assert!(cfg.filter.validate().is_ok());
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let mut cfg = FilterConfig::default();
        cfg.thresholds.insert("cpu".into(), -1.0);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NegativeValue {
                field: "thresholds",
                metric: "cpu".into(),
                value: -1.0,
            })
        );
    }

    #[test]
    fn anomaly_parameters_checked_only_when_enabled() {
        let mut cfg = FilterConfig {
            anomaly_change_threshold: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());

        cfg.anomaly_detection_enabled = true;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositive { field: "anomaly_change_threshold", .. })
        ));
    }

    #[test]
    fn composite_threshold_checked_when_multi_metric_enabled() {
        let cfg = FilterConfig {
            multi_metric_enabled: true,
            composite_threshold: -0.5,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositive { field: "composite_threshold", .. })
        ));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let mut cfg = FilterConfig::default();
        cfg.min_thresholds.insert("cpu".into(), 50.0);
        cfg.max_thresholds.insert("cpu".into(), 10.0);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvertedBounds { .. })));
    }

    #[test]
    fn normalization_raises_and_caps_anomaly_sizes() {
        let cfg = FilterConfig {
            anomaly_min_data_points: 1,
            anomaly_history_size: 1_000,
            smoothing_factor: 3.0,
            ..Default::default()
        }
        .normalized();

        assert_eq!(cfg.anomaly_min_data_points, MIN_ANOMALY_DATA_POINTS);
        assert_eq!(cfg.anomaly_history_size, MAX_ANOMALY_HISTORY);
        assert_eq!(cfg.smoothing_factor, 0.2);

        let cfg = FilterConfig {
            anomaly_min_data_points: 8,
            anomaly_history_size: 4,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.anomaly_history_size, 8);
    }

    #[test]
    fn oversized_windows_are_capped() {
        let cfg = FilterConfig {
            retention_minutes: 200_000_000_000_000_000,
            anomaly_retention_minutes: Some(u64::MAX),
            dynamic_update_interval_secs: u64::MAX,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
        // Raw values still produce a sane window
        assert_eq!(cfg.retention_window(), Duration::minutes(MAX_RETENTION_MINUTES as i64));

        let cfg = cfg.normalized();
        assert_eq!(cfg.retention_minutes, MAX_RETENTION_MINUTES);
        assert_eq!(cfg.anomaly_retention_minutes, Some(MAX_RETENTION_MINUTES));
        assert_eq!(cfg.dynamic_update_interval_secs, MAX_DYNAMIC_INTERVAL_SECS);
        assert_eq!(
            cfg.anomaly_retention_window(),
            Duration::minutes(MAX_RETENTION_MINUTES as i64)
        );
    }

    #[test]
    fn anomaly_window_defaults_to_standard_retention() {
        let cfg = FilterConfig {
            retention_minutes: 7,
            ..Default::default()
        };
        assert_eq!(cfg.anomaly_retention_window(), Duration::minutes(7));
    }

    #[test]
    fn env_vars_are_expanded() {
        std::env::set_var("ADAPTIVE_FILTER_TEST_LEVEL", "debug");
        let out = expand_env_vars("log_level = \"${ADAPTIVE_FILTER_TEST_LEVEL}\"").unwrap();
        assert_eq!(out, "log_level = \"debug\"");
    }

    #[test]
    fn path_entries_need_separator() {
        assert!(is_path_entry("/usr/sbin/nginx"));
        assert!(is_path_entry(r"C:\nginx\nginx.exe"));
        assert!(!is_path_entry("nginx"));
    }
}

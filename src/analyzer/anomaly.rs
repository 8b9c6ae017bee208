use std::collections::VecDeque;

use crate::config::FilterConfig;

/// Rolling-average spike detection.
/// Flags values whose percent change over the mean of recent history
/// reaches the configured threshold.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    history_size: usize,
    min_data_points: usize,
    change_threshold: f64,
}

/// A fired anomaly, kept for the decision log
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub metric: String,
    pub value: f64,
    pub percent_change: f64,
    pub mean: f64,
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} value {:.2} is {:.1}% above rolling mean {:.2}",
            self.metric, self.value, self.percent_change, self.mean
        )
    }
}

impl AnomalyDetector {
    /// Expects a normalized config
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            history_size: config.anomaly_history_size,
            min_data_points: config.anomaly_min_data_points,
            change_threshold: config.anomaly_change_threshold,
        }
    }

    /// Evaluate `value` against `history`, then append it.
    ///
    /// The value is appended whether or not it fires, and the oldest entries
    /// are dropped to keep the history bounded.
    pub fn observe(&self, history: &mut VecDeque<f64>, metric: &str, value: f64) -> Option<Anomaly> {
        let finding = self.evaluate(history, metric, value);

        history.push_back(value);
        while history.len() > self.history_size {
            history.pop_front();
        }

        finding
    }

    fn evaluate(&self, history: &VecDeque<f64>, metric: &str, value: f64) -> Option<Anomaly> {
        if history.len() < self.min_data_points {
            return None;
        }

        let mean = history.iter().sum::<f64>() / history.len() as f64;
        let pct = percent_change(mean, value);

        if pct >= self.change_threshold {
            Some(Anomaly {
                metric: metric.to_string(),
                value,
                percent_change: pct,
                mean,
            })
        } else {
            None
        }
    }
}

/// Percent change of `value` over `mean`, zero when the mean is zero
pub fn percent_change(mean: f64, value: f64) -> f64 {
    if mean == 0.0 {
        return 0.0;
    }
    (value - mean) / mean * 100.0
}

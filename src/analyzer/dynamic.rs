use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::FilterConfig;
use crate::extractor::MetricValues;

/// Share of the observed batch average added on top of the static threshold
pub const DYNAMIC_SCALING_FACTOR: f64 = 0.5;

/// Self-adjusting per-metric thresholds.
///
/// Seeded from static thresholds, then moved toward
/// `static + average * DYNAMIC_SCALING_FACTOR` by exponential smoothing and
/// clamped to the configured min/max.
#[derive(Debug, Clone, Default)]
pub struct DynamicThresholds {
    current: HashMap<String, f64>,
    last_update: Option<DateTime<Utc>>,
}

impl DynamicThresholds {
    pub fn seeded(config: &FilterConfig) -> Self {
        Self {
            current: config.thresholds.clone(),
            last_update: None,
        }
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.current.get(metric).copied()
    }

    /// Updates are throttled to once per half the configured interval
    pub fn is_due(&self, now: DateTime<Utc>, interval_secs: u64) -> bool {
        match self.last_update {
            None => true,
            Some(last) => {
                let half_ms = i64::try_from(interval_secs)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(500);
                match Duration::try_milliseconds(half_ms) {
                    Some(half) => now - last >= half,
                    None => false,
                }
            }
        }
    }

    /// Blend each statically thresholded metric toward its new target.
    ///
    /// Metrics missing from `averages` keep their previous threshold.
    /// Returns the number of thresholds updated.
    pub fn update(
        &mut self,
        config: &FilterConfig,
        averages: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> usize {
        let alpha = config.smoothing_factor;
        let mut updated = 0;

        for (metric, &static_threshold) in &config.thresholds {
            let Some(&average) = averages.get(metric) else {
                continue;
            };
            let previous = self.current.get(metric).copied().unwrap_or(static_threshold);
            let target = static_threshold + average * DYNAMIC_SCALING_FACTOR;
            let blended = alpha * target + (1.0 - alpha) * previous;
            let clamped = clamp(
                blended,
                config.min_thresholds.get(metric).copied(),
                config.max_thresholds.get(metric).copied(),
            );

            tracing::debug!(
                metric = %metric,
                previous,
                target,
                threshold = clamped,
                "Dynamic threshold updated"
            );
            self.current.insert(metric.clone(), clamped);
            updated += 1;
        }

        self.last_update = Some(now);
        updated
    }
}

fn clamp(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let mut v = value;
    if let Some(min) = min {
        v = v.max(min);
    }
    if let Some(max) = max {
        v = v.min(max);
    }
    v
}

/// Average each metric over the resources that reported it
pub fn batch_averages<'a>(samples: impl IntoIterator<Item = &'a MetricValues>) -> HashMap<String, f64> {
    let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
    for values in samples {
        for (metric, &value) in values {
            let entry = sums.entry(metric.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(metric, (sum, n))| (metric, sum / n as f64))
        .collect()
}

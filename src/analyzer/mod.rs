pub mod anomaly;
pub mod composite;
pub mod dynamic;

use crate::config::FilterConfig;

use self::dynamic::DynamicThresholds;

/// Where an effective threshold came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSource {
    Static,
    Dynamic,
}

/// Threshold the threshold stage compares a metric against.
///
/// Uses the dynamic table when dynamic thresholds are enabled and the metric
/// has an entry there, the static threshold otherwise.
pub fn effective_threshold(
    config: &FilterConfig,
    dynamic: &DynamicThresholds,
    metric: &str,
) -> Option<(f64, ThresholdSource)> {
    if config.dynamic_thresholds_enabled {
        if let Some(t) = dynamic.get(metric) {
            return Some((t, ThresholdSource::Dynamic));
        }
    }
    config
        .thresholds
        .get(metric)
        .map(|&t| (t, ThresholdSource::Static))
}

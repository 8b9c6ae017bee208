use std::collections::BTreeMap;

use crate::config::FilterConfig;
use crate::types::ResourceMetrics;

/// Metric name to summed value for one resource, sorted by name
pub type MetricValues = BTreeMap<String, f64>;

/// Pull values for targeted metrics out of a resource.
///
/// Only gauge and sum points are summed; histograms and summaries are skipped.
/// Non-finite points are ignored.
pub fn extract_values(resource: &ResourceMetrics, config: &FilterConfig) -> MetricValues {
    let mut values = MetricValues::new();

    for metric in &resource.metrics {
        if !metric.kind.is_scalar() || !config.is_targeted(&metric.name) {
            continue;
        }
        let mut points = metric
            .data_points
            .iter()
            .map(|p| p.value)
            .filter(|v| v.is_finite())
            .peekable();
        if points.peek().is_none() {
            continue;
        }
        *values.entry(metric.name.clone()).or_insert(0.0) += points.sum::<f64>();
    }

    values
}

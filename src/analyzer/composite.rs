use crate::config::FilterConfig;
use crate::extractor::MetricValues;

use super::dynamic::DynamicThresholds;

/// Threshold synthesized for weighted metrics that have none configured
pub const FALLBACK_THRESHOLD_FACTOR: f64 = 1.5;

/// Weighted sum of threshold-relative ratios
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeScore {
    pub score: f64,
    pub contributors: usize,
    /// `metric:value/threshold*weight` terms joined by `+`
    pub trace: String,
}

/// Score a resource across all weighted metrics it reported.
///
/// Each term is `(value / threshold) * weight`. The threshold is the dynamic
/// one when enabled, else the static one, else `1.5 * value`. Terms with a
/// non-positive threshold are skipped.
pub fn composite_score(
    values: &MetricValues,
    config: &FilterConfig,
    dynamic: &DynamicThresholds,
) -> CompositeScore {
    let mut score = 0.0;
    let mut terms = Vec::new();

    for (metric, &value) in values {
        let Some(&weight) = config.weights.get(metric) else {
            continue;
        };

        let threshold = config
            .dynamic_thresholds_enabled
            .then(|| dynamic.get(metric))
            .flatten()
            .or_else(|| config.thresholds.get(metric).copied())
            .unwrap_or(value * FALLBACK_THRESHOLD_FACTOR);

        if threshold <= 0.0 {
            continue;
        }

        score += value / threshold * weight;
        terms.push(format!("{}:{:.2}/{:.2}*{:.2}", metric, value, threshold, weight));
    }

    CompositeScore {
        score,
        contributors: terms.len(),
        trace: terms.join("+"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FilterConfig {
        let mut cfg = FilterConfig {
            multi_metric_enabled: true,
            ..Default::default()
        };
        cfg.thresholds.insert("cpu".into(), 50.0);
        cfg.thresholds.insert("mem".into(), 1000.0);
        cfg.weights.insert("cpu".into(), 0.6);
        cfg.weights.insert("mem".into(), 0.4);
        cfg
    }

    #[test]
    fn score_is_additive() {
        let cfg = config();
        let values = MetricValues::from([("cpu".to_string(), 100.0), ("mem".to_string(), 2000.0)]);
        let result = composite_score(&values, &cfg, &DynamicThresholds::seeded(&cfg));

        assert!((result.score - 2.0).abs() < 1e-9);
        assert_eq!(result.contributors, 2);
        assert!(result.trace.contains("cpu:100.00/50.00*0.60"));
    }

    #[test]
    fn no_weighted_metrics_scores_zero() {
        let cfg = config();
        let values = MetricValues::from([("disk".to_string(), 10.0)]);
        let result = composite_score(&values, &cfg, &DynamicThresholds::seeded(&cfg));
        assert_eq!(result.score, 0.0);
        assert_eq!(result.contributors, 0);
        assert!(result.trace.is_empty());
    }

    #[test]
    fn unthresholded_metric_uses_fallback() {
        let mut cfg = config();
        cfg.weights.insert("net".into(), 0.3);
        let values = MetricValues::from([("net".to_string(), 900.0)]);
        let result = composite_score(&values, &cfg, &DynamicThresholds::seeded(&cfg));
        assert!((result.score - 0.3 / FALLBACK_THRESHOLD_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn dynamic_threshold_used_when_enabled() {
        let mut cfg = config();
        cfg.dynamic_thresholds_enabled = true;
        let mut table = DynamicThresholds::seeded(&cfg);
        table.update(
            &cfg,
            &std::collections::HashMap::from([("cpu".to_string(), 100.0)]),
            chrono::Utc::now(),
        );
        let dynamic_cpu = table.get("cpu").unwrap();

        let values = MetricValues::from([("cpu".to_string(), 100.0)]);
        let result = composite_score(&values, &cfg, &table);
        assert!((result.score - 100.0 / dynamic_cpu * 0.6).abs() < 1e-9);
    }
}

use chrono::{DateTime, Utc};
use smallvec::smallvec;

use crate::engine::FilteredBatch;
use crate::types::{DataPoint, Label, Metric, MetricKind, ResourceMetrics};

/// Marks the synthetic summary resource so later stages can skip it
pub const SUMMARY_ATTRIBUTE: &str = "adaptive_filter.summary";

pub const METRIC_FILTERED_RATIO: &str = "adaptive_filter.filtered_ratio";
pub const METRIC_INCLUDED: &str = "adaptive_filter.resources.included";
pub const METRIC_FILTERED: &str = "adaptive_filter.resources.filtered";
pub const METRIC_STAGE_HITS: &str = "adaptive_filter.stage.hits";

/// Build the summary resource for a filtered batch.
///
/// Returns `None` when nothing was evaluated. Stages with zero hits are
/// left out of the breakdown.
pub fn build_summary(result: &FilteredBatch, hostname: &str, now: DateTime<Utc>) -> Option<ResourceMetrics> {
    if result.evaluated == 0 {
        return None;
    }

    let filtered = result.filtered();
    let ratio = filtered as f64 / result.evaluated as f64;

    let gauge = |name: &str, value: f64| Metric {
        name: name.to_string(),
        kind: MetricKind::Gauge,
        data_points: vec![DataPoint {
            timestamp: Some(now),
            ..DataPoint::new(value)
        }],
    };

    let stage_points: Vec<DataPoint> = result
        .stage_counts
        .iter()
        .filter(|(_, hits)| **hits > 0)
        .map(|(stage, &hits)| DataPoint {
            timestamp: Some(now),
            value: hits as f64,
            count: None,
            labels: smallvec![Label {
                key: "stage".into(),
                value: stage.to_string(),
            }],
        })
        .collect();

    let mut metrics = vec![
        gauge(METRIC_FILTERED_RATIO, ratio),
        gauge(METRIC_INCLUDED, result.included as f64),
        gauge(METRIC_FILTERED, filtered as f64),
    ];
    if !stage_points.is_empty() {
        metrics.push(Metric {
            name: METRIC_STAGE_HITS.to_string(),
            kind: MetricKind::Sum,
            data_points: stage_points,
        });
    }

    let mut resource = ResourceMetrics {
        metrics,
        ..Default::default()
    };
    resource.set_attr(SUMMARY_ATTRIBUTE, true);
    resource.set_attr("service.name", "adaptive-filter");
    resource.set_attr("host.name", hostname);

    Some(resource)
}

/// Append the summary to the filtered output, if there is one to append
pub fn append_summary(result: &mut FilteredBatch, hostname: &str, now: DateTime<Utc>) -> bool {
    match build_summary(result, hostname, now) {
        Some(summary) => {
            result.batch.resources.push(summary);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn result(evaluated: usize, included: usize, counts: &[(&'static str, usize)]) -> FilteredBatch {
        FilteredBatch {
            evaluated,
            included,
            stage_counts: counts.iter().copied().collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    fn metric<'a>(r: &'a ResourceMetrics, name: &str) -> &'a Metric {
        r.metrics.iter().find(|m| m.name == name).unwrap()
    }

    #[test]
    fn no_summary_for_empty_input() {
        let mut empty = FilteredBatch::default();
        assert!(!append_summary(&mut empty, "host", Utc::now()));
        assert!(empty.batch.resources.is_empty());
    }

    #[test]
    fn reports_counts_and_ratio() {
        let r = result(4, 1, &[("static_threshold", 1), ("filtered", 3), ("retention", 0)]);
        let summary = build_summary(&r, "web-1", Utc::now()).unwrap();

        assert_eq!(metric(&summary, METRIC_FILTERED_RATIO).data_points[0].value, 0.75);
        assert_eq!(metric(&summary, METRIC_INCLUDED).data_points[0].value, 1.0);
        assert_eq!(metric(&summary, METRIC_FILTERED).data_points[0].value, 3.0);

        let hits = metric(&summary, METRIC_STAGE_HITS);
        let stages: Vec<&str> = hits.data_points.iter().filter_map(|p| p.label("stage")).collect();
        assert_eq!(stages, vec!["filtered", "static_threshold"]);
        assert!(summary.attributes.contains_key(SUMMARY_ATTRIBUTE));
    }
}

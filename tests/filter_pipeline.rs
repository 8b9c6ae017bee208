use adaptive_filter::config::{FilterConfig, StorageConfig};
use adaptive_filter::engine::FilterEngine;
use adaptive_filter::persist::path_guard::PathGuard;
use adaptive_filter::processor::{FilterProcessor, MetricsStage};
use adaptive_filter::stage::{EXCEEDED_LABEL, STAGE_ATTRIBUTE, THRESHOLD_LABEL};
use adaptive_filter::summary::{METRIC_FILTERED, METRIC_INCLUDED, METRIC_STAGE_HITS, SUMMARY_ATTRIBUTE};
use adaptive_filter::types::{MetricBatch, ResourceMetrics};
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

fn batch_from_json(json: &str) -> MetricBatch {
    serde_json::from_str(json).unwrap()
}

fn process(pid: i64, cpu: f64) -> ResourceMetrics {
    serde_json::from_value(serde_json::json!({
        "attributes": { "host.name": "node-a", "process.pid": pid },
        "metrics": [
            { "name": "process.cpu.utilization", "kind": "gauge", "data_points": [{ "value": cpu }] }
        ]
    }))
    .unwrap()
}

fn config() -> FilterConfig {
    let mut cfg = FilterConfig {
        retention_minutes: 10,
        ..Default::default()
    };
    cfg.thresholds.insert("process.cpu.utilization".into(), 50.0);
    cfg
}

fn summary(batch: &MetricBatch) -> &ResourceMetrics {
    batch
        .resources
        .iter()
        .find(|r| r.attributes.contains_key(SUMMARY_ATTRIBUTE))
        .expect("summary resource")
}

fn gauge(resource: &ResourceMetrics, name: &str) -> f64 {
    resource
        .metrics
        .iter()
        .find(|m| m.name == name)
        .map(|m| m.data_points[0].value)
        .unwrap()
}

#[tokio::test]
async fn filters_batch_end_to_end() {
    let engine = FilterEngine::new(&config(), &StorageConfig::default()).unwrap();
    let processor = FilterProcessor::from_engine(engine, "node-a".into());
    processor.start().await.unwrap();

    let batch = batch_from_json(
        r#"{
        "resources": [
            { "attributes": { "process.pid": 1, "process.executable.path": "/usr/bin/busy" },
              "metrics": [ { "name": "process.cpu.utilization", "kind": "gauge",
                             "data_points": [ { "value": 40.0 }, { "value": 30.0 } ] } ] },
            { "attributes": { "process.pid": 2 },
              "metrics": [ { "name": "process.cpu.utilization", "kind": "gauge",
                             "data_points": [ { "value": 3.0 } ] } ] },
            { "attributes": { "service.name": "edge" },
              "metrics": [ { "name": "http.requests", "kind": "sum",
                             "data_points": [ { "value": 12.0 } ] } ] }
        ]
    }"#,
    );

    let out = processor
        .process_batch(&CancellationToken::new(), batch)
        .await
        .unwrap();

    // pid 1 (summed to 70), the untargeted service, and the summary
    assert_eq!(out.len(), 3);
    let busy = &out.resources[0];
    assert!(!busy.attributes.contains_key(STAGE_ATTRIBUTE));
    let point = &busy.metrics[0].data_points[0];
    assert_eq!(point.label(THRESHOLD_LABEL), Some("50"));
    assert_eq!(point.label(EXCEEDED_LABEL), Some("true"));

    let s = summary(&out);
    assert_eq!(gauge(s, METRIC_INCLUDED), 2.0);
    assert_eq!(gauge(s, METRIC_FILTERED), 1.0);
    let stages: Vec<&str> = s
        .metrics
        .iter()
        .find(|m| m.name == METRIC_STAGE_HITS)
        .unwrap()
        .data_points
        .iter()
        .filter_map(|p| p.label("stage"))
        .collect();
    assert_eq!(stages, vec!["filtered", "not_targeted", "static_threshold"]);

    processor.shutdown().await.unwrap();
}

#[test]
fn retention_keeps_resource_until_window_lapses() {
    let engine = FilterEngine::new(&config(), &StorageConfig::default()).unwrap();
    let processor = FilterProcessor::from_engine(engine, "node-a".into());
    let t0 = Utc::now();
    let quiet_neighbour = || process(99, 90.0);

    let out = processor.process_at(MetricBatch::new(vec![process(7, 80.0), quiet_neighbour()]), t0);
    assert_eq!(out.len(), 3);

    let out = processor.process_at(
        MetricBatch::new(vec![process(7, 1.0), quiet_neighbour()]),
        t0 + Duration::minutes(9),
    );
    assert_eq!(out.len(), 3, "pid 7 still retained");

    let out = processor.process_at(
        MetricBatch::new(vec![process(7, 1.0), quiet_neighbour()]),
        t0 + Duration::minutes(11),
    );
    assert_eq!(out.len(), 2, "pid 7 dropped once retention lapsed");
    assert_eq!(out.resources[0].attr_str("process.pid").as_deref(), Some("99"));
}

#[tokio::test]
async fn state_persists_across_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        enabled: true,
        path: Some(tmp.path().join("nested").join("state.json").to_string_lossy().into_owned()),
    };

    let first = FilterEngine::with_guard(&config(), &storage, PathGuard::new(tmp.path())).unwrap();
    let processor = FilterProcessor::from_engine(first, "node-a".into());
    processor.process_at(MetricBatch::new(vec![process(5, 75.0)]), Utc::now());
    processor.shutdown().await.unwrap();
    assert!(tmp.path().join("nested").join("state.json").exists());

    let second = FilterEngine::with_guard(&config(), &storage, PathGuard::new(tmp.path())).unwrap();
    let entity = second.entity("process:node-a:5").expect("restored entity");
    assert_eq!(entity.current_values["process.cpu.utilization"], 75.0);
    assert!(entity.last_exceeded.is_some());
}

use std::panic::{self, AssertUnwindSafe};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::engine::{FilteredBatch, FilterEngine};
use crate::stage::STAGE_ATTRIBUTE;
use crate::summary::append_summary;
use crate::types::MetricBatch;

/// Trait for pipeline stages that transform metric batches.
///
/// The host delivers one batch at a time and owns backpressure.
#[async_trait]
pub trait MetricsStage: Send + Sync {
    /// Human-readable name for this stage
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    /// Transform a batch. A cancelled call hands the input back untouched.
    async fn process_batch(
        &self,
        cancel: &CancellationToken,
        batch: MetricBatch,
    ) -> Result<MetricBatch, ProcessError>;

    /// Flush state and release resources
    async fn shutdown(&self) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The host cancelled before evaluation started; `batch` is the input
    #[error("batch cancelled before filtering")]
    Cancelled { batch: MetricBatch },
}

impl ProcessError {
    pub fn into_batch(self) -> MetricBatch {
        match self {
            ProcessError::Cancelled { batch } => batch,
        }
    }
}

/// Fail-open wrapper around the filter engine.
///
/// Whenever filtering cannot produce a trustworthy result the input batch is
/// forwarded instead.
pub struct FilterProcessor {
    engine: FilterEngine,
    hostname: String,
}

impl FilterProcessor {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let engine = FilterEngine::new(&config.filter, &config.storage)?;
        Ok(Self::from_engine(engine, config.agent.hostname.clone()))
    }

    pub fn from_engine(engine: FilterEngine, hostname: String) -> Self {
        Self { engine, hostname }
    }

    /// Filter `batch` as of `now`, falling back to the input on failure.
    /// Background upkeep is scheduled whichever way the batch went.
    pub fn process_at(&self, batch: MetricBatch, now: DateTime<Utc>) -> MetricBatch {
        if batch.is_empty() {
            return batch;
        }

        let outcome = fail_open(batch, |b| self.engine.filter_batch_at(b, now));
        self.engine.maintain(now);

        match outcome {
            Ok(mut result) => {
                append_summary(&mut result, &self.hostname, now);
                for resource in &mut result.batch.resources {
                    resource.attributes.remove(STAGE_ATTRIBUTE);
                }
                result.batch
            }
            Err(batch) => batch,
        }
    }
}

/// Run `filter` over `batch`, handing the input back when it panics or
/// drops every evaluated resource
fn fail_open<F>(batch: MetricBatch, filter: F) -> Result<FilteredBatch, MetricBatch>
where
    F: FnOnce(&MetricBatch) -> FilteredBatch,
{
    let result = match panic::catch_unwind(AssertUnwindSafe(|| filter(&batch))) {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                resources = batch.len(),
                "Filtering failed, forwarding unfiltered batch"
            );
            return Err(batch);
        }
    };

    if result.evaluated > 0 && result.included == 0 {
        tracing::warn!(
            resources = batch.len(),
            "Filtering dropped every resource, forwarding unfiltered batch"
        );
        return Err(batch);
    }

    Ok(result)
}

#[async_trait]
impl MetricsStage for FilterProcessor {
    fn name(&self) -> &str {
        "adaptive_filter"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn process_batch(
        &self,
        cancel: &CancellationToken,
        batch: MetricBatch,
    ) -> Result<MetricBatch, ProcessError> {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled { batch });
        }
        Ok(self.process_at(batch, Utc::now()))
    }

    async fn shutdown(&self) -> Result<()> {
        self.engine.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, StorageConfig};
    use crate::summary::SUMMARY_ATTRIBUTE;
    use crate::types::{Metric, ResourceMetrics};

    fn processor() -> FilterProcessor {
        let mut cfg = FilterConfig::default();
        cfg.thresholds.insert("cpu".into(), 50.0);
        let engine = FilterEngine::new(&cfg, &StorageConfig::default()).unwrap();
        FilterProcessor::from_engine(engine, "test-host".into())
    }

    fn service(name: &str, cpu: f64) -> ResourceMetrics {
        let mut r = ResourceMetrics::default();
        r.set_attr("service.name", name);
        r.metrics.push(Metric::gauge("cpu", cpu));
        r
    }

    #[test]
    fn empty_batch_gets_no_summary() {
        let out = processor().process_at(MetricBatch::default(), Utc::now());
        assert!(out.is_empty());
    }

    #[test]
    fn stage_attribute_is_stripped_and_summary_appended() {
        let batch = MetricBatch::new(vec![service("hot", 90.0), service("cold", 1.0)]);
        let out = processor().process_at(batch, Utc::now());

        assert_eq!(out.len(), 2);
        assert_eq!(out.resources[0].attr_str("service.name").as_deref(), Some("hot"));
        assert!(!out.resources[0].attributes.contains_key(STAGE_ATTRIBUTE));
        assert!(out.resources[1].attributes.contains_key(SUMMARY_ATTRIBUTE));
    }

    #[test]
    fn all_filtered_falls_back_to_input() {
        let batch = MetricBatch::new(vec![service("a", 1.0), service("b", 2.0)]);
        let out = processor().process_at(batch.clone(), Utc::now());
        assert_eq!(out, batch);
    }

    #[test]
    fn panic_during_filtering_forwards_input() {
        let batch = MetricBatch::new(vec![service("hot", 90.0)]);
        let outcome = fail_open(batch.clone(), |_| panic!("filter blew up"));
        assert_eq!(outcome, Err(batch));
    }

    #[test]
    fn upkeep_runs_when_every_batch_falls_back() {
        let mut cfg = FilterConfig {
            anomaly_detection_enabled: true,
            retention_minutes: 1,
            ..Default::default()
        };
        cfg.thresholds.insert("cpu".into(), 50.0);
        let engine = FilterEngine::with_draw(&cfg, || 0.0).unwrap();
        let p = FilterProcessor::from_engine(engine.clone(), "test-host".into());
        let t0 = Utc::now();

        for i in 0..50 {
            let quiet = MetricBatch::new(vec![service(&format!("svc-{}", i), 1.0)]);
            let out = p.process_at(quiet.clone(), t0 + chrono::Duration::minutes(2 * i));
            assert_eq!(out, quiet);
        }
        assert_eq!(engine.tracked_entities(), 1);
    }

    #[tokio::test]
    async fn cancelled_batch_is_returned_untouched() {
        let p = processor();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = MetricBatch::new(vec![service("hot", 90.0)]);
        let err = p.process_batch(&cancel, batch.clone()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }));
        assert_eq!(err.into_batch(), batch);
    }
}

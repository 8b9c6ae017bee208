//! Stateful filtering core.
//!
//! Each resource is walked through the filter stages in a fixed order and the
//! first stage that admits it decides the outcome:
//!
//! 1. not targeted (no metric of interest present)
//! 2. defunct process
//! 3. include list (full executable paths only)
//! 4. anomaly detection
//! 5. static or dynamic threshold
//! 6. multi-metric composite score
//! 7. anomaly retention, then standard retention (known entities only)
//! 8. debug passthrough
//!
//! Anything left over is filtered. Shared state sits behind one
//! reader/writer lock that is taken per resource, never across a batch.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};

use crate::analyzer::anomaly::AnomalyDetector;
use crate::analyzer::composite::composite_score;
use crate::analyzer::dynamic::{batch_averages, DynamicThresholds};
use crate::analyzer::{effective_threshold, ThresholdSource};
use crate::config::{is_path_entry, ConfigError, FilterConfig, StorageConfig};
use crate::extractor::{extract_values, MetricValues};
use crate::identity::{executable_path, is_defunct, resource_identity};
use crate::persist::path_guard::PathGuard;
use crate::persist::StateStore;
use crate::stage::{FilterDecision, FilterStage, EXCEEDED_LABEL, STAGE_ATTRIBUTE, THRESHOLD_LABEL};
use crate::summary::SUMMARY_ATTRIBUTE;
use crate::tracker::{EntityTable, TrackedEntity};
use crate::types::{MetricBatch, ResourceMetrics};

/// Chance per batch of scheduling expired-entity cleanup
pub const CLEANUP_CHANCE: f64 = 0.01;

/// Chance per batch of scheduling a state snapshot
pub const PERSIST_CHANCE: f64 = 0.05;

/// Snapshots are written at most this often
pub const PERSIST_MIN_INTERVAL_SECS: i64 = 60;

/// Longest a background task waits for the state lock before giving up
pub const BACKGROUND_LOCK_TIMEOUT: StdDuration = StdDuration::from_millis(50);

/// Everything guarded by the engine lock
#[derive(Debug, Default)]
struct EngineState {
    entities: EntityTable,
    thresholds: DynamicThresholds,
}

struct Shared {
    config: FilterConfig,
    anomaly: AnomalyDetector,
    include_paths: HashSet<String>,
    state: RwLock<EngineState>,
    store: Option<StateStore>,
    last_persist: Mutex<Option<DateTime<Utc>>>,
    /// Uniform draw in `[0, 1)` that gates background upkeep
    draw: fn() -> f64,
}

/// Per-metric threshold outcome for one resource
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricEvaluation {
    pub threshold: f64,
    pub exceeded: bool,
}

/// Decision plus the per-metric detail recorded on the output
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: FilterDecision,
    pub metrics: BTreeMap<String, MetricEvaluation>,
}

/// Result of filtering one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredBatch {
    pub batch: MetricBatch,
    /// Resources that went through evaluation
    pub evaluated: usize,
    pub included: usize,
    /// Hit count per stage name, including `filtered`
    pub stage_counts: BTreeMap<&'static str, usize>,
}

impl FilteredBatch {
    pub fn filtered(&self) -> usize {
        self.evaluated - self.included
    }
}

/// Thread-safe filter engine. Clones share state.
#[derive(Clone)]
pub struct FilterEngine {
    shared: Arc<Shared>,
}

impl FilterEngine {
    /// Build an engine whose storage is confined to the platform state dir
    pub fn new(config: &FilterConfig, storage: &StorageConfig) -> Result<Self, ConfigError> {
        Self::with_guard(config, storage, PathGuard::platform_default())
    }

    pub fn with_guard(
        config: &FilterConfig,
        storage: &StorageConfig,
        guard: PathGuard,
    ) -> Result<Self, ConfigError> {
        Self::build(config, storage, guard, fastrand::f64)
    }

    fn build(
        config: &FilterConfig,
        storage: &StorageConfig,
        guard: PathGuard,
        draw: fn() -> f64,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = config.normalized();

        let store = if storage.enabled {
            let path = storage.resolve_path(&guard)?;
            Some(StateStore::open(guard, &path)?)
        } else {
            None
        };

        let entities = match &store {
            Some(store) => match store.load() {
                Ok(entities) => {
                    tracing::info!(
                        path = %store.path().display(),
                        entities = entities.len(),
                        "Restored filter state"
                    );
                    EntityTable::from_entities(entities)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load filter state, starting empty");
                    EntityTable::new()
                }
            },
            None => EntityTable::new(),
        };

        let include_paths = config
            .include_list
            .iter()
            .filter(|e| is_path_entry(e))
            .cloned()
            .collect();

        tracing::info!(
            thresholds = config.thresholds.len(),
            weights = config.weights.len(),
            dynamic = config.dynamic_thresholds_enabled,
            multi_metric = config.multi_metric_enabled,
            anomaly = config.anomaly_detection_enabled,
            storage = store.is_some(),
            "Initialized filter engine"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                anomaly: AnomalyDetector::new(&config),
                state: RwLock::new(EngineState {
                    entities,
                    thresholds: DynamicThresholds::seeded(&config),
                }),
                include_paths,
                config,
                store,
                last_persist: Mutex::new(None),
                draw,
            }),
        })
    }

    /// Normalized configuration in effect
    pub fn config(&self) -> &FilterConfig {
        &self.shared.config
    }

    pub fn tracked_entities(&self) -> usize {
        self.shared.state.read().entities.len()
    }

    pub fn entity(&self, identity: &str) -> Option<TrackedEntity> {
        self.shared.state.read().entities.get(identity).cloned()
    }

    pub fn dynamic_threshold(&self, metric: &str) -> Option<f64> {
        self.shared.state.read().thresholds.get(metric)
    }

    pub fn filter_batch(&self, batch: &MetricBatch) -> FilteredBatch {
        self.filter_batch_at(batch, Utc::now())
    }

    /// Filter a batch as of `now`
    pub fn filter_batch_at(&self, batch: &MetricBatch, now: DateTime<Utc>) -> FilteredBatch {
        let config = &self.shared.config;
        let extracted: Vec<Option<MetricValues>> = batch
            .resources
            .iter()
            .map(|r| (!is_summary(r)).then(|| extract_values(r, config)))
            .collect();

        if config.dynamic_thresholds_enabled {
            self.update_dynamic_thresholds(extracted.iter().flatten(), now);
        }

        let mut out = FilteredBatch::default();
        for (resource, values) in batch.resources.iter().zip(&extracted) {
            let Some(values) = values else {
                // Summaries from an upstream stage pass untouched and uncounted
                out.batch.resources.push(resource.clone());
                continue;
            };

            let evaluation = self.evaluate_at(resource, values, now);
            out.evaluated += 1;
            *out.stage_counts.entry(evaluation.decision.stage.name()).or_insert(0) += 1;

            if evaluation.decision.included {
                out.included += 1;
                out.batch.resources.push(annotate(resource.clone(), &evaluation));
            }
        }

        tracing::debug!(
            evaluated = out.evaluated,
            included = out.included,
            tracked = self.tracked_entities(),
            "Batch filtered"
        );
        out
    }

    fn update_dynamic_thresholds<'a>(
        &self,
        values: impl IntoIterator<Item = &'a MetricValues>,
        now: DateTime<Utc>,
    ) {
        let interval = self.shared.config.dynamic_update_interval_secs;
        if !self.shared.state.read().thresholds.is_due(now, interval) {
            return;
        }

        let averages = batch_averages(values);
        let mut state = self.shared.state.write();
        // Another batch may have updated while we computed averages
        if state.thresholds.is_due(now, interval) {
            let updated = state.thresholds.update(&self.shared.config, &averages, now);
            tracing::debug!(updated, "Dynamic thresholds recomputed");
        }
    }

    /// Decide a single resource as of `now`
    pub fn evaluate_at(
        &self,
        resource: &ResourceMetrics,
        values: &MetricValues,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let config = &self.shared.config;

        if values.is_empty() {
            return Evaluation {
                decision: FilterDecision::include(FilterStage::NotTargeted),
                metrics: BTreeMap::new(),
            };
        }

        let identity = resource_identity(resource);

        let mut state = self.shared.state.write();
        let EngineState {
            entities,
            thresholds,
        } = &mut *state;

        let metrics = metric_details(config, thresholds, values);

        let bypass = if is_defunct(resource) {
            Some(FilterStage::DefunctProcess)
        } else if self.is_included_path(resource) {
            Some(FilterStage::IncludeList)
        } else {
            None
        };
        if let Some(stage) = bypass {
            if let Some(entity) = entities.get_mut(&identity) {
                entity.record_values(values, now);
            }
            return Evaluation {
                decision: FilterDecision::include(stage),
                metrics,
            };
        }

        let existing = entities.contains(&identity);
        let decision = match entities.get_mut(&identity) {
            Some(entity) => {
                entity.record_values(values, now);
                self.run_stages(entity, false, values, thresholds, now)
            }
            None => {
                let mut entity = TrackedEntity::new(identity.clone(), resource.flat_attributes(), now);
                entity.record_values(values, now);
                let decision = self.run_stages(&mut entity, true, values, thresholds, now);
                if decision.included || config.debug_all_stages || config.anomaly_detection_enabled {
                    entities.insert(entity);
                }
                decision
            }
        };
        drop(state);

        tracing::debug!(
            identity = %identity,
            existing,
            included = decision.included,
            stage = %decision.stage,
            "Resource evaluated"
        );

        Evaluation { decision, metrics }
    }

    fn is_included_path(&self, resource: &ResourceMetrics) -> bool {
        if self.shared.include_paths.is_empty() {
            return false;
        }
        executable_path(resource).is_some_and(|p| self.shared.include_paths.contains(&p))
    }

    fn run_stages(
        &self,
        entity: &mut TrackedEntity,
        is_new: bool,
        values: &MetricValues,
        thresholds: &DynamicThresholds,
        now: DateTime<Utc>,
    ) -> FilterDecision {
        let config = &self.shared.config;

        if config.anomaly_detection_enabled {
            let mut fired = None;
            // Every metric is observed so each history keeps growing
            for (metric, &value) in values {
                if !config.thresholds.contains_key(metric) {
                    continue;
                }
                let history = entity.metric_history.entry(metric.clone()).or_default();
                if let Some(anomaly) = self.shared.anomaly.observe(history, metric, value) {
                    fired.get_or_insert(anomaly);
                }
            }
            if let Some(anomaly) = fired {
                entity.mark_anomaly(now);
                tracing::debug!(identity = %entity.identity, reason = %anomaly, "Anomaly detected");
                return FilterDecision::include(FilterStage::AnomalyDetection);
            }
        }

        for (metric, &value) in values {
            let Some(&static_threshold) = config.thresholds.get(metric) else {
                continue;
            };
            if static_threshold == 0.0 {
                entity.mark_exceeded(now);
                return FilterDecision::include(FilterStage::StaticThreshold);
            }
            if let Some((threshold, source)) = effective_threshold(config, thresholds, metric) {
                if value > threshold {
                    entity.mark_exceeded(now);
                    return FilterDecision::include(match source {
                        ThresholdSource::Static => FilterStage::StaticThreshold,
                        ThresholdSource::Dynamic => FilterStage::DynamicThreshold,
                    });
                }
            }
        }

        if config.multi_metric_enabled {
            let composite = composite_score(values, config, thresholds);
            if composite.contributors > 0 && composite.score >= config.composite_threshold {
                entity.mark_exceeded(now);
                tracing::debug!(
                    identity = %entity.identity,
                    score = composite.score,
                    trace = %composite.trace,
                    "Composite threshold reached"
                );
                return FilterDecision::include(FilterStage::MultiMetric);
            }
        }

        if !is_new {
            if entity.within_anomaly_retention(now, config.anomaly_retention_window()) {
                return FilterDecision::include(FilterStage::AnomalyRetention);
            }
            if entity.within_retention(now, config.retention_window()) {
                return FilterDecision::include(FilterStage::Retention);
            }
        }

        if config.debug_all_stages {
            return FilterDecision::include(FilterStage::DebugPassthrough(near_misses(
                config, thresholds, values,
            )));
        }

        FilterDecision::exclude()
    }

    /// Schedule low-priority upkeep. Cheap when nothing is drawn.
    pub fn maintain(&self, now: DateTime<Utc>) {
        let draw = self.shared.draw;
        if draw() < CLEANUP_CHANCE {
            self.spawn_background(move |engine| {
                engine.cleanup_expired(now);
            });
        }

        if self.shared.store.is_some() && draw() < PERSIST_CHANCE && self.persist_due(now) {
            self.spawn_background(move |engine| {
                if let Err(e) = engine.persist(now) {
                    tracing::warn!(error = %e, "Failed to save filter state");
                }
            });
        }
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: FnOnce(&FilterEngine) + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = self.clone();
                handle.spawn_blocking(move || task(&engine));
            }
            Err(_) => task(self),
        }
    }

    /// Remove entities whose retention windows have lapsed.
    /// Returns `None` if the lock could not be taken in time.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> Option<usize> {
        let config = &self.shared.config;
        let Some(mut state) = self.shared.state.try_write_for(BACKGROUND_LOCK_TIMEOUT) else {
            tracing::debug!("Cleanup skipped, state lock busy");
            return None;
        };
        let removed = state.entities.remove_expired(
            now,
            config.retention_window(),
            config.anomaly_retention_window(),
        );
        let remaining = state.entities.len();
        drop(state);

        if removed > 0 {
            tracing::info!(removed, remaining, "Expired entities removed");
        }
        Some(removed)
    }

    fn persist_due(&self, now: DateTime<Utc>) -> bool {
        match *self.shared.last_persist.lock() {
            None => true,
            Some(last) => now - last >= Duration::seconds(PERSIST_MIN_INTERVAL_SECS),
        }
    }

    /// Claim the snapshot slot for `now`. The throttle only moves forward once
    /// a snapshot has been taken.
    fn claim_persist_slot(&self, now: DateTime<Utc>) -> bool {
        let mut last = self.shared.last_persist.lock();
        if last.is_some_and(|t| now - t < Duration::seconds(PERSIST_MIN_INTERVAL_SECS)) {
            return false;
        }
        *last = Some(now);
        true
    }

    /// Snapshot the entity table and write it out.
    /// Returns `Ok(false)` when nothing was written.
    pub fn persist(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(store) = &self.shared.store else {
            return Ok(false);
        };
        if !self.persist_due(now) {
            return Ok(false);
        }

        let Some(state) = self.shared.state.try_read_for(BACKGROUND_LOCK_TIMEOUT) else {
            tracing::debug!("Snapshot skipped, state lock busy");
            return Ok(false);
        };
        let snapshot = state.entities.snapshot();
        drop(state);

        if !self.claim_persist_slot(now) {
            return Ok(false);
        }

        store.save(&snapshot)
    }

    /// Flush state and release the store. Later saves are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        let Some(store) = &self.shared.store else {
            return Ok(());
        };
        let snapshot = self.shared.state.read().entities.snapshot();
        let result = store.save(&snapshot);
        store.close();
        match result {
            Ok(saved) => {
                tracing::info!(saved, entities = snapshot.len(), "Filter state flushed");
                Ok(())
            }
            Err(e) => Err(e.context("Failed to flush filter state on shutdown")),
        }
    }
}

fn is_summary(resource: &ResourceMetrics) -> bool {
    resource.attributes.contains_key(SUMMARY_ATTRIBUTE)
}

fn metric_details(
    config: &FilterConfig,
    thresholds: &DynamicThresholds,
    values: &MetricValues,
) -> BTreeMap<String, MetricEvaluation> {
    values
        .iter()
        .filter_map(|(metric, &value)| {
            let (threshold, _) = effective_threshold(config, thresholds, metric)?;
            let zero_static = config.thresholds.get(metric) == Some(&0.0);
            Some((
                metric.clone(),
                MetricEvaluation {
                    threshold,
                    exceeded: zero_static || value > threshold,
                },
            ))
        })
        .collect()
}

/// `metric=value/threshold` ratios plus the composite score when enabled
fn near_misses(config: &FilterConfig, thresholds: &DynamicThresholds, values: &MetricValues) -> String {
    let mut parts: Vec<String> = values
        .iter()
        .filter_map(|(metric, &value)| {
            let (threshold, _) = effective_threshold(config, thresholds, metric)?;
            (threshold > 0.0).then(|| format!("{}={:.2}", metric, value / threshold))
        })
        .collect();
    if config.multi_metric_enabled {
        let composite = composite_score(values, config, thresholds);
        parts.push(format!(
            "score={:.2}/{:.2}",
            composite.score, config.composite_threshold
        ));
    }
    parts.join(",")
}

/// Tag an included resource with its stage and per-metric threshold detail
fn annotate(mut resource: ResourceMetrics, evaluation: &Evaluation) -> ResourceMetrics {
    resource.set_attr(STAGE_ATTRIBUTE, evaluation.decision.stage.label());
    for metric in &mut resource.metrics {
        let Some(detail) = evaluation.metrics.get(&metric.name) else {
            continue;
        };
        if !metric.kind.is_scalar() {
            continue;
        }
        for point in &mut metric.data_points {
            point.set_label(THRESHOLD_LABEL, detail.threshold.to_string());
            point.set_label(EXCEEDED_LABEL, detail.exceeded.to_string());
        }
    }
    resource
}

#[cfg(test)]
impl FilterEngine {
    /// Engine without storage whose upkeep draws come from `draw`
    pub(crate) fn with_draw(config: &FilterConfig, draw: fn() -> f64) -> Result<Self, ConfigError> {
        Self::build(config, &StorageConfig::default(), PathGuard::platform_default(), draw)
    }
}

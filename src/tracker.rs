use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::extractor::MetricValues;

/// Cross-batch state for one resource identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub identity: String,
    pub first_seen: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_exceeded: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_anomaly_detected: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_values: BTreeMap<String, f64>,
    #[serde(default)]
    pub max_values: BTreeMap<String, f64>,
    #[serde(default)]
    pub metric_history: BTreeMap<String, VecDeque<f64>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl TrackedEntity {
    pub fn new(identity: String, attributes: BTreeMap<String, String>, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            first_seen: now,
            last_seen: Some(now),
            last_exceeded: None,
            last_anomaly_detected: None,
            current_values: BTreeMap::new(),
            max_values: BTreeMap::new(),
            metric_history: BTreeMap::new(),
            attributes,
        }
    }

    /// Record the latest values and raise the high-water marks
    pub fn record_values(&mut self, values: &MetricValues, now: DateTime<Utc>) {
        for (metric, &value) in values {
            self.current_values.insert(metric.clone(), value);
            let max = self.max_values.entry(metric.clone()).or_insert(value);
            if value > *max {
                *max = value;
            }
        }
        self.touch(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = Some(self.last_seen.map_or(now, |seen| seen.max(now)));
    }

    /// Stamps never move backwards
    pub fn mark_exceeded(&mut self, now: DateTime<Utc>) {
        self.last_exceeded = Some(self.last_exceeded.map_or(now, |t| t.max(now)));
    }

    pub fn mark_anomaly(&mut self, now: DateTime<Utc>) {
        self.last_anomaly_detected = Some(self.last_anomaly_detected.map_or(now, |t| t.max(now)));
    }

    pub fn within_retention(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        within(self.last_exceeded, now, retention)
    }

    pub fn within_anomaly_retention(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        within(self.last_anomaly_detected, now, retention)
    }

    /// Both retention windows lapsed and the resource has not been seen for
    /// a full standard window either
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration, anomaly_retention: Duration) -> bool {
        !self.within_retention(now, retention)
            && !self.within_anomaly_retention(now, anomaly_retention)
            && !within(self.last_seen.or(Some(self.first_seen)), now, retention)
    }
}

fn within(stamp: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    match stamp {
        Some(t) => now - t < window,
        None => false,
    }
}

/// All tracked entities, keyed by identity
#[derive(Debug, Clone, Default)]
pub struct EntityTable {
    entities: HashMap<String, TrackedEntity>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: HashMap<String, TrackedEntity>) -> Self {
        Self { entities }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&TrackedEntity> {
        self.entities.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut TrackedEntity> {
        self.entities.get_mut(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entities.contains_key(identity)
    }

    /// Insert only if absent; the first entity for an identity wins
    pub fn insert(&mut self, entity: TrackedEntity) -> &mut TrackedEntity {
        self.entities
            .entry(entity.identity.clone())
            .or_insert(entity)
    }

    /// Drop every entity whose retention windows have lapsed
    pub fn remove_expired(&mut self, now: DateTime<Utc>, retention: Duration, anomaly_retention: Duration) -> usize {
        let before = self.entities.len();
        self.entities
            .retain(|_, e| !e.is_expired(now, retention, anomaly_retention));
        before - self.entities.len()
    }

    pub fn snapshot(&self) -> HashMap<String, TrackedEntity> {
        self.entities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(now: DateTime<Utc>) -> TrackedEntity {
        TrackedEntity::new("process:1".into(), BTreeMap::new(), now)
    }

    #[test]
    fn records_current_and_max_values() {
        let now = Utc::now();
        let mut e = entity(now);
        e.record_values(&MetricValues::from([("cpu".to_string(), 50.0)]), now);
        e.record_values(&MetricValues::from([("cpu".to_string(), 20.0)]), now);
        assert_eq!(e.current_values["cpu"], 20.0);
        assert_eq!(e.max_values["cpu"], 50.0);
    }

    #[test]
    fn stamps_are_monotonic() {
        let now = Utc::now();
        let mut e = entity(now);
        e.mark_exceeded(now);
        e.mark_exceeded(now - Duration::minutes(5));
        assert_eq!(e.last_exceeded, Some(now));

        e.mark_anomaly(now);
        e.mark_anomaly(now - Duration::seconds(1));
        assert_eq!(e.last_anomaly_detected, Some(now));
    }

    #[test]
    fn retention_window_is_exclusive_at_the_end() {
        let t0 = Utc::now();
        let retention = Duration::minutes(10);
        let mut e = entity(t0);
        e.mark_exceeded(t0);

        assert!(e.within_retention(t0 + Duration::minutes(9), retention));
        assert!(!e.within_retention(t0 + Duration::minutes(10), retention));
        assert!(!e.within_anomaly_retention(t0, retention));
    }

    #[test]
    fn insert_keeps_first_entity() {
        let now = Utc::now();
        let mut table = EntityTable::new();
        table.insert(entity(now));
        let mut later = entity(now + Duration::minutes(1));
        later.attributes.insert("k".into(), "v".into());
        table.insert(later);

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("process:1").unwrap().first_seen, now);
        assert!(table.get("process:1").unwrap().attributes.is_empty());
    }

    #[test]
    fn expired_entities_are_removed() {
        let t0 = Utc::now();
        let retention = Duration::minutes(5);
        let mut table = EntityTable::new();

        let mut stale = entity(t0);
        stale.mark_exceeded(t0);
        table.insert(stale);

        let mut fresh = TrackedEntity::new("process:2".into(), BTreeMap::new(), t0);
        fresh.mark_anomaly(t0 + Duration::minutes(4));
        table.insert(fresh);

        let removed = table.remove_expired(t0 + Duration::minutes(6), retention, retention);
        assert_eq!(removed, 1);
        assert!(table.contains("process:2"));
        assert!(!table.contains("process:1"));
    }
}

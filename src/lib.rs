pub mod analyzer;
pub mod config;
pub mod engine;
pub mod extractor;
pub mod identity;
pub mod persist;
pub mod processor;
pub mod stage;
pub mod summary;
pub mod tracker;

/// Common types used across modules
pub mod types {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use smallvec::SmallVec;

    /// Resource attributes, ordered by key
    pub type Attributes = BTreeMap<String, AttributeValue>;

    /// One delivery unit from the host pipeline
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct MetricBatch {
        #[serde(default)]
        pub resources: Vec<ResourceMetrics>,
    }

    impl MetricBatch {
        pub fn new(resources: Vec<ResourceMetrics>) -> Self {
            Self { resources }
        }

        pub fn is_empty(&self) -> bool {
            self.resources.is_empty()
        }

        pub fn len(&self) -> usize {
            self.resources.len()
        }
    }

    /// A monitored entity and the metrics it reported in this batch
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct ResourceMetrics {
        #[serde(default)]
        pub attributes: Attributes,
        #[serde(default)]
        pub metrics: Vec<Metric>,
    }

    impl ResourceMetrics {
        pub fn attr_str(&self, key: &str) -> Option<String> {
            self.attributes.get(key).map(|v| v.to_string())
        }

        pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
            self.attributes.insert(key.into(), value.into());
        }

        /// Flatten attributes into string pairs for diagnostics and persistence
        pub fn flat_attributes(&self) -> BTreeMap<String, String> {
            self.attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect()
        }
    }

    /// Attribute value as carried on the wire
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum AttributeValue {
        Bool(bool),
        Int(i64),
        Double(f64),
        String(String),
    }

    impl std::fmt::Display for AttributeValue {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                AttributeValue::Bool(b) => write!(f, "{}", b),
                AttributeValue::Int(i) => write!(f, "{}", i),
                AttributeValue::Double(d) => write!(f, "{}", d),
                AttributeValue::String(s) => write!(f, "{}", s),
            }
        }
    }

    impl From<&str> for AttributeValue {
        fn from(s: &str) -> Self {
            AttributeValue::String(s.to_string())
        }
    }

    impl From<String> for AttributeValue {
        fn from(s: String) -> Self {
            AttributeValue::String(s)
        }
    }

    impl From<i64> for AttributeValue {
        fn from(i: i64) -> Self {
            AttributeValue::Int(i)
        }
    }

    impl From<f64> for AttributeValue {
        fn from(d: f64) -> Self {
            AttributeValue::Double(d)
        }
    }

    impl From<bool> for AttributeValue {
        fn from(b: bool) -> Self {
            AttributeValue::Bool(b)
        }
    }

    /// A named measurement with one or more data points
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Metric {
        pub name: String,
        pub kind: MetricKind,
        #[serde(default)]
        pub data_points: Vec<DataPoint>,
    }

    impl Metric {
        pub fn gauge(name: impl Into<String>, value: f64) -> Self {
            Self {
                name: name.into(),
                kind: MetricKind::Gauge,
                data_points: vec![DataPoint::new(value)],
            }
        }
    }

    /// Shape of a metric's data points
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum MetricKind {
        /// Instantaneous value
        Gauge,
        /// Running total
        Sum,
        Histogram,
        Summary,
    }

    impl MetricKind {
        /// Distribution-shaped kinds are never scored
        pub fn is_scalar(&self) -> bool {
            matches!(self, MetricKind::Gauge | MetricKind::Sum)
        }
    }

    /// A single data point. For distribution kinds `value` holds the sum.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct DataPoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub timestamp: Option<DateTime<Utc>>,
        pub value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub count: Option<u64>,
        #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
        pub labels: SmallVec<[Label; 4]>,
    }

    impl DataPoint {
        pub fn new(value: f64) -> Self {
            Self {
                timestamp: None,
                value,
                count: None,
                labels: SmallVec::new(),
            }
        }

        /// Insert or replace a label
        pub fn set_label(&mut self, key: &str, value: String) {
            match self.labels.iter_mut().find(|l| l.key == key) {
                Some(label) => label.value = value,
                None => self.labels.push(Label {
                    key: key.to_string(),
                    value,
                }),
            }
        }

        pub fn label(&self, key: &str) -> Option<&str> {
            self.labels
                .iter()
                .find(|l| l.key == key)
                .map(|l| l.value.as_str())
        }
    }

    /// A label key-value pair
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Label {
        pub key: String,
        pub value: String,
    }
}

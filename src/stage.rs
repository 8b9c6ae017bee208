/// Resource attribute carrying the deciding stage while a batch is in flight
pub const STAGE_ATTRIBUTE: &str = "adaptive_filter.stage";

/// Data point label holding the threshold a metric was compared against
pub const THRESHOLD_LABEL: &str = "adaptive_filter.threshold";

/// Data point label recording whether the metric crossed its threshold
pub const EXCEEDED_LABEL: &str = "adaptive_filter.exceeded";

/// The stage that decided a resource's fate. Exactly one per evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterStage {
    NotTargeted,
    DefunctProcess,
    IncludeList,
    AnomalyDetection,
    StaticThreshold,
    DynamicThreshold,
    MultiMetric,
    AnomalyRetention,
    Retention,
    /// Kept only because debug passthrough is on; carries near-miss ratios
    DebugPassthrough(String),
    Filtered,
}

impl FilterStage {
    pub fn name(&self) -> &'static str {
        match self {
            FilterStage::NotTargeted => "not_targeted",
            FilterStage::DefunctProcess => "defunct_process",
            FilterStage::IncludeList => "include_list",
            FilterStage::AnomalyDetection => "anomaly_detection",
            FilterStage::StaticThreshold => "static_threshold",
            FilterStage::DynamicThreshold => "dynamic_threshold",
            FilterStage::MultiMetric => "multi_metric",
            FilterStage::AnomalyRetention => "anomaly_retention",
            FilterStage::Retention => "retention",
            FilterStage::DebugPassthrough(_) => "debug_passthrough",
            FilterStage::Filtered => "filtered",
        }
    }

    /// Value written to the stage attribute
    pub fn label(&self) -> String {
        match self {
            FilterStage::DebugPassthrough(detail) if !detail.is_empty() => {
                format!("debug_passthrough[{}]", detail)
            }
            other => other.name().to_string(),
        }
    }
}

impl std::fmt::Display for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Result of evaluating one resource
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    pub included: bool,
    pub stage: FilterStage,
}

impl FilterDecision {
    pub fn include(stage: FilterStage) -> Self {
        Self { included: true, stage }
    }

    pub fn exclude() -> Self {
        Self {
            included: false,
            stage: FilterStage::Filtered,
        }
    }
}

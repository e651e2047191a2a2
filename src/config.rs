use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub const DEFAULT_TRAFFIC_PERCENT: f64 = 100.0;
pub const DEFAULT_MIN_SAMPLE_SIZE: u64 = 100;
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;
pub const DEFAULT_VARIANT_WEIGHT: u32 = 50;

/// An experiment definition. One test targets one kind of external entity
/// (e.g. "listing" or "product") and carries two or more variants.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    pub id: String,
    pub name: String,
    pub description: String,
    pub entity_kind: String,
    pub target_field: String,
    /// Opaque filter predicate; shape is the calling domain's concern.
    pub filters: IndexMap<String, Value>,
    pub traffic_percent: f64,
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
    pub primary_metric: PrimaryMetric,
    pub secondary_metrics: Vec<PrimaryMetric>,
    pub min_sample_size: u64,
    pub confidence_level: f64,
    pub status: TestStatus,
    pub winning_variant_id: Option<String>,
    /// Set only after completion.
    pub is_significant: Option<bool>,
    pub conclusion: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PrimaryMetric {
    ConversionRate,
    ClickRate,
    Revenue,
    AvgOrderValue,
}

impl PrimaryMetric {
    /// Human-readable name used in generated conclusion text.
    pub fn label(&self) -> &'static str {
        match self {
            PrimaryMetric::ConversionRate => "conversion rate",
            PrimaryMetric::ClickRate => "click rate",
            PrimaryMetric::Revenue => "revenue",
            PrimaryMetric::AvgOrderValue => "average order value",
        }
    }
}

/// One arm of a test. Counter fields are only ever incremented, by the
/// event recorder. Note: conversions are tracked as `sales` here, while the
/// per-entity [`Assignment`] calls the same events `conversions`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub test_id: String,
    pub name: String,
    pub is_control: bool,
    /// Opaque description of what this arm changes.
    pub changes: IndexMap<String, Value>,
    pub weight: u32,
    pub impressions: u64,
    pub clicks: u64,
    pub views: u64,
    pub sales: u64,
    pub revenue: f64,
}

/// The durable binding of one entity to one variant within one test.
/// At most one exists per (test, entity) pair; the store enforces this
/// atomically at insert time.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub test_id: String,
    pub variant_id: String,
    pub entity_id: String,
    pub entity_kind: String,
    pub impressions: u64,
    pub clicks: u64,
    pub views: u64,
    pub conversions: u64,
    pub revenue: f64,
    pub assigned_at: i64,
    pub last_event_at: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Impression,
    Click,
    View,
    Conversion,
}

/// Input for creating a test. Missing knobs fall back to the documented
/// defaults; variant weights are normalized to a 100-point scale.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateTest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub entity_kind: String,
    #[serde(default)]
    pub target_field: String,
    #[serde(default)]
    pub filters: IndexMap<String, Value>,
    #[serde(default)]
    pub traffic_percent: Option<f64>,
    #[serde(default)]
    pub start_at: Option<i64>,
    #[serde(default)]
    pub end_at: Option<i64>,
    #[serde(default)]
    pub primary_metric: Option<PrimaryMetric>,
    #[serde(default)]
    pub secondary_metrics: Vec<PrimaryMetric>,
    #[serde(default)]
    pub min_sample_size: Option<u64>,
    #[serde(default)]
    pub confidence_level: Option<f64>,
    #[serde(default)]
    pub variants: Vec<VariantDraft>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VariantDraft {
    pub name: String,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default)]
    pub changes: IndexMap<String, Value>,
    #[serde(default)]
    pub weight: Option<u32>,
}

/// Normalizes input weights so they sum to 100. Each missing weight counts
/// as 50. Per-weight rounding can drift the final sum by a point or two;
/// that drift is accepted rather than corrected.
pub fn normalize_weights(inputs: &[Option<u32>]) -> Result<Vec<u32>, EngineError> {
    let raw: Vec<u32> = inputs
        .iter()
        .map(|w| w.unwrap_or(DEFAULT_VARIANT_WEIGHT))
        .collect();
    let total: u64 = raw.iter().map(|&w| w as u64).sum();
    if !raw.is_empty() && total == 0 {
        return Err(EngineError::InvalidConfig(
            "variant weights must sum to a positive value".to_string(),
        ));
    }
    Ok(raw
        .iter()
        .map(|&w| ((w as f64 / total as f64) * 100.0).round() as u32)
        .collect())
}

impl Test {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::MissingInput("name"));
        }
        if self.entity_kind.trim().is_empty() {
            return Err(EngineError::MissingInput("entityKind"));
        }
        if !(0.0..=100.0).contains(&self.traffic_percent) {
            return Err(EngineError::InvalidConfig(
                "trafficPercent must be within [0, 100]".to_string(),
            ));
        }
        Ok(())
    }
}

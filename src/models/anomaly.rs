use serde::{Deserialize, Serialize};

/// Entities the analytics layer tracks.
pub const ENTITY_TYPES: &[&str] = &["user", "host", "ip", "app"];

/// Historical mean/stddev for one (entity, metric) in one hour-of-week cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub entity_type: String,
    pub entity_id: String,
    pub metric_name: String,
    /// 0..=23
    pub hour_of_day: u32,
    /// 0 = Monday .. 6 = Sunday.
    pub day_of_week: u32,
    pub mean: f64,
    pub stddev: f64,
    pub sample_count: u64,
    pub updated_at: String,
}

/// A stored detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: String,
    pub timestamp: String,
    pub entity_type: String,
    pub entity_id: String,
    /// spike | drop | time_anomaly | new_behavior
    pub anomaly_type: String,
    pub metric_name: String,
    pub observed: f64,
    pub expected: Option<f64>,
    pub deviation_score: f64,
    pub risk_score: u8,
    /// low | medium | high | critical
    pub severity: String,
    /// JSON array of correlated message snippets.
    pub related_logs: String,
    /// JSON object with extra detection context.
    pub context: String,
    pub is_false_positive: bool,
    pub feedback_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct AnomalyFeedbackRequest {
    pub is_false_positive: bool,
}

/// Severity counts for the anomaly overview, feedback-filtered.
#[derive(Debug, Serialize)]
pub struct AnomalySummary {
    pub total: u64,
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::models::anomaly::AnomalyFeedbackRequest;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListAnomaliesParams {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub include_false_positives: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

pub async fn list_anomalies(
    State(state): State<AppState>,
    Query(params): Query<ListAnomaliesParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let anomalies = state
        .catalog
        .list_anomalies(
            params.entity_type.as_deref(),
            params.severity.as_deref(),
            params.include_false_positives,
            params.limit.min(1000),
        )
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(anomalies))
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    #[serde(default = "default_since_hours")]
    pub hours: i64,
}

fn default_since_hours() -> i64 {
    24
}

pub async fn anomaly_summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let since = (chrono::Utc::now() - chrono::Duration::hours(params.hours.clamp(1, 24 * 90)))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();
    let summary = state
        .catalog
        .anomaly_summary(&since)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(summary))
}

/// Operator feedback; flagged rows drop out of dashboard aggregations.
pub async fn set_feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AnomalyFeedbackRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let updated = state
        .catalog
        .set_anomaly_feedback(&id, req.is_false_positive)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, format!("no anomaly {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

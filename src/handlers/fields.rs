use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::extract::FieldExtractor;
use crate::models::catalog::{CreatePatternRequest, TestPatternRequest, UpsertFieldPreferenceRequest};
use crate::AppState;

type HandlerError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct DiscoverParams {
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
    #[serde(default = "default_sample_limit")]
    pub limit: u32,
}

fn default_window_hours() -> u32 {
    24
}

fn default_sample_limit() -> u32 {
    10_000
}

/// Sample recent events and report structured fields by occurrence.
pub async fn discover_fields(
    State(state): State<AppState>,
    Query(params): Query<DiscoverParams>,
) -> Result<impl IntoResponse, HandlerError> {
    let fields = state
        .storage
        .discover_structured_fields(params.window_hours.min(24 * 30), params.limit.min(100_000))
        .await
        .map_err(internal)?;
    Ok(Json(fields))
}

// ── Extraction patterns ──

pub async fn list_patterns(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, HandlerError> {
    Ok(Json(state.catalog.list_patterns().map_err(internal)?))
}

pub async fn create_pattern(
    State(state): State<AppState>,
    Json(req): Json<CreatePatternRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    // Refuse patterns that cannot compile instead of skipping them later.
    if let Err(e) = FieldExtractor::test_pattern(req.pattern_type, &req.pattern, "") {
        return Err((StatusCode::BAD_REQUEST, e.to_string()));
    }
    let id = uuid::Uuid::new_v4().to_string();
    state
        .catalog
        .create_pattern(
            &id,
            &req.name,
            &req.pattern,
            req.pattern_type,
            req.priority,
            req.field_prefix.as_deref(),
            req.enabled,
        )
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;
    reload_extractor(&state)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

pub async fn delete_pattern(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    if !state.catalog.delete_pattern(&id).map_err(internal)? {
        return Err((StatusCode::NOT_FOUND, format!("no pattern {id}")));
    }
    reload_extractor(&state)?;
    Ok(StatusCode::NO_CONTENT)
}

fn reload_extractor(state: &AppState) -> Result<(), HandlerError> {
    let patterns = state.catalog.list_patterns().map_err(internal)?;
    state.extractor.load_patterns(&patterns);
    Ok(())
}

/// Dry-run a pattern against a sample. Never touches catalog state.
pub async fn test_pattern(
    Json(req): Json<TestPatternRequest>,
) -> impl IntoResponse {
    match FieldExtractor::test_pattern(req.pattern_type, &req.pattern, &req.sample) {
        Ok(fields) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "fields": fields })),
        ),
        Err(e) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

// ── Field preferences ──

pub async fn list_preferences(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, HandlerError> {
    Ok(Json(state.catalog.list_field_preferences().map_err(internal)?))
}

pub async fn upsert_preference(
    State(state): State<AppState>,
    Json(req): Json<UpsertFieldPreferenceRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let id = uuid::Uuid::new_v4().to_string();
    state
        .catalog
        .upsert_field_preference(
            &id,
            &req.field_name,
            req.display_name.as_deref().unwrap_or(&req.field_name),
            req.pinned,
            req.sort_order,
        )
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

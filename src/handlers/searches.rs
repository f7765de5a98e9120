use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::models::catalog::CreateSavedSearchRequest;
use crate::models::dashboard::CreateAnnotationRequest;
use crate::AppState;

type HandlerError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ── Saved searches ──

pub async fn list_saved_searches(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, HandlerError> {
    Ok(Json(state.catalog.list_saved_searches().map_err(internal)?))
}

pub async fn create_saved_search(
    State(state): State<AppState>,
    Json(req): Json<CreateSavedSearchRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    // Reject queries that do not parse; saved garbage helps nobody.
    if let Err(e) = state.engine.validate_query(&req.query) {
        return Err((StatusCode::BAD_REQUEST, e.to_string()));
    }
    let id = uuid::Uuid::new_v4().to_string();
    state
        .catalog
        .create_saved_search(
            &id,
            &req.name,
            &req.query,
            req.earliest.as_deref(),
            req.latest.as_deref(),
        )
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

pub async fn delete_saved_search(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    if !state.catalog.delete_saved_search(&id).map_err(internal)? {
        return Err((StatusCode::NOT_FOUND, format!("no saved search {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Annotations ──

#[derive(Debug, Deserialize)]
pub struct AnnotationParams {
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub field_value: Option<String>,
}

pub async fn list_annotations(
    State(state): State<AppState>,
    Query(params): Query<AnnotationParams>,
) -> Result<impl IntoResponse, HandlerError> {
    let annotations = state
        .catalog
        .list_annotations(params.field_name.as_deref(), params.field_value.as_deref())
        .map_err(internal)?;
    Ok(Json(annotations))
}

pub async fn create_annotation(
    State(state): State<AppState>,
    Json(req): Json<CreateAnnotationRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let id = uuid::Uuid::new_v4().to_string();
    state
        .catalog
        .create_annotation(
            &id,
            &req.field_name,
            &req.field_value,
            &req.note,
            req.dashboard_id.as_deref(),
        )
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

pub async fn delete_annotation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    if !state.catalog.delete_annotation(&id).map_err(internal)? {
        return Err((StatusCode::NOT_FOUND, format!("no annotation {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::models::catalog::{valid_index_name, CreateIndexRequest, UpdateIndexRequest};
use crate::AppState;

pub async fn list_indexes(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let indexes = state
        .catalog
        .list_indexes()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(indexes))
}

pub async fn create_index(
    State(state): State<AppState>,
    Json(req): Json<CreateIndexRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !valid_index_name(&req.name) {
        return Err((
            StatusCode::BAD_REQUEST,
            "index names are lowercase alphanumerics, '-' and '_'".to_string(),
        ));
    }
    if !(1..=365).contains(&req.retention_days) {
        return Err((
            StatusCode::BAD_REQUEST,
            "retention_days must be within 1..=365".to_string(),
        ));
    }
    state
        .catalog
        .create_index(&req.name, req.retention_days)
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;
    let index = state
        .catalog
        .get_index(&req.name)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((StatusCode::CREATED, Json(index)))
}

pub async fn update_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateIndexRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !(1..=365).contains(&req.retention_days) {
        return Err((
            StatusCode::BAD_REQUEST,
            "retention_days must be within 1..=365".to_string(),
        ));
    }
    let updated = state
        .catalog
        .update_index_retention(&name, req.retention_days)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, format!("no index named '{name}'")));
    }
    let index = state
        .catalog
        .get_index(&name)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(index))
}

pub async fn delete_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deleted = state
        .catalog
        .delete_index(&name)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !deleted {
        return Err((StatusCode::NOT_FOUND, format!("no index named '{name}'")));
    }
    Ok(StatusCode::NO_CONTENT)
}

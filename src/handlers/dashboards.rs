use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::engine::substitute_variables;
use crate::models::dashboard::{
    CreateDashboardRequest, CreatePanelRequest, CreateVariableRequest, PanelResult,
};
use crate::models::query::{QueryErrorResponse, QueryRequest};
use crate::AppState;

type HandlerError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub async fn list_dashboards(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, HandlerError> {
    Ok(Json(state.catalog.list_dashboards().map_err(internal)?))
}

pub async fn create_dashboard(
    State(state): State<AppState>,
    Json(req): Json<CreateDashboardRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let id = uuid::Uuid::new_v4().to_string();
    state
        .catalog
        .create_dashboard(&id, &req.name, &req.description)
        .map_err(internal)?;
    let dashboard = state.catalog.get_dashboard(&id).map_err(internal)?;
    Ok((StatusCode::CREATED, Json(dashboard)))
}

pub async fn get_dashboard(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let Some(dashboard) = state.catalog.get_dashboard(&id).map_err(internal)? else {
        return Err((StatusCode::NOT_FOUND, format!("no dashboard {id}")));
    };
    let panels = state.catalog.list_panels(&id).map_err(internal)?;
    let variables = state.catalog.list_variables(&id).map_err(internal)?;
    Ok(Json(serde_json::json!({
        "dashboard": dashboard,
        "panels": panels,
        "variables": variables,
    })))
}

pub async fn update_dashboard(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateDashboardRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let updated = state
        .catalog
        .update_dashboard(&id, &req.name, &req.description)
        .map_err(internal)?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, format!("no dashboard {id}")));
    }
    Ok(Json(state.catalog.get_dashboard(&id).map_err(internal)?))
}

pub async fn delete_dashboard(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    if !state.catalog.delete_dashboard(&id).map_err(internal)? {
        return Err((StatusCode::NOT_FOUND, format!("no dashboard {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_panel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreatePanelRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    if state.catalog.get_dashboard(&id).map_err(internal)?.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("no dashboard {id}")));
    }
    let panel_id = uuid::Uuid::new_v4().to_string();
    state
        .catalog
        .create_panel(
            &panel_id,
            &id,
            &req.title,
            &req.panel_type,
            &req.query,
            req.earliest.as_deref(),
            req.latest.as_deref(),
            &req.position,
            &req.options,
        )
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": panel_id }))))
}

pub async fn update_panel(
    State(state): State<AppState>,
    Path((id, panel_id)): Path<(String, String)>,
    Json(req): Json<CreatePanelRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let updated = state
        .catalog
        .update_panel(
            &panel_id,
            &id,
            &req.title,
            &req.panel_type,
            &req.query,
            req.earliest.as_deref(),
            req.latest.as_deref(),
            &req.position,
            &req.options,
        )
        .map_err(internal)?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, format!("no panel {panel_id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_panel(
    State(state): State<AppState>,
    Path((id, panel_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    if !state.catalog.delete_panel(&panel_id, &id).map_err(internal)? {
        return Err((StatusCode::NOT_FOUND, format!("no panel {panel_id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_variable(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateVariableRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let variable_id = uuid::Uuid::new_v4().to_string();
    state
        .catalog
        .create_variable(&variable_id, &id, &req.name, &req.default_value)
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": variable_id }))))
}

pub async fn delete_variable(
    State(state): State<AppState>,
    Path((id, variable_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    if !state
        .catalog
        .delete_variable(&variable_id, &id)
        .map_err(internal)?
    {
        return Err((StatusCode::NOT_FOUND, format!("no variable {variable_id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RunDashboardParams {
    #[serde(default)]
    pub earliest: Option<String>,
    #[serde(default)]
    pub latest: Option<String>,
}

/// Execute every panel query; one failing panel does not fail the run.
pub async fn run_dashboard(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RunDashboardParams>,
) -> Result<impl IntoResponse, HandlerError> {
    if state.catalog.get_dashboard(&id).map_err(internal)?.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("no dashboard {id}")));
    }
    let panels = state.catalog.list_panels(&id).map_err(internal)?;
    let variables: Vec<(String, String)> = state
        .catalog
        .list_variables(&id)
        .map_err(internal)?
        .into_iter()
        .map(|v| (v.name, v.default_value))
        .collect();

    let mut results = Vec::with_capacity(panels.len());
    for panel in panels {
        let query = substitute_variables(&panel.query, &variables);
        let request = QueryRequest {
            query,
            earliest: params.earliest.clone().or(panel.earliest.clone()),
            latest: params.latest.clone().or(panel.latest.clone()),
            extract_fields: false,
            source_type: None,
        };
        match state.engine.execute(&request).await {
            Ok(resp) => results.push(PanelResult {
                panel_id: panel.id,
                title: panel.title,
                result: Some(resp),
                error: None,
            }),
            Err(e) => results.push(PanelResult {
                panel_id: panel.id,
                title: panel.title,
                result: None,
                error: Some(QueryErrorResponse::from(&e)),
            }),
        }
    }
    Ok(Json(serde_json::json!({ "panels": results })))
}

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::models::query::{QueryErrorResponse, QueryRequest, ValidateRequest};
use crate::AppState;

/// Execute a DSL query.
pub async fn execute_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> impl IntoResponse {
    match state.engine.execute(&req).await {
        Ok(resp) => (StatusCode::OK, Json(serde_json::json!(resp))),
        Err(e) => {
            tracing::debug!("query failed: {e}");
            let status = match e.kind() {
                "storage_error" | "plan_error" => StatusCode::INTERNAL_SERVER_ERROR,
                "timeout" => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_REQUEST,
            };
            (status, Json(serde_json::json!(QueryErrorResponse::from(&e))))
        }
    }
}

/// Parse and validate a DSL query without running it.
pub async fn validate_query(
    State(state): State<AppState>,
    Json(req): Json<ValidateRequest>,
) -> impl IntoResponse {
    match state.engine.validate_query(&req.query) {
        Ok(validation) => (StatusCode::OK, Json(serde_json::json!(validation))),
        Err(e) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "valid": false,
                "errors": [QueryErrorResponse::from(&e)],
                "warnings": [],
            })),
        ),
    }
}

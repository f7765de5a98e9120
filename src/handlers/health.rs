use axum::{extract::State, Json};

use crate::AppState;

pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let storage_ok = state
        .storage
        .execute_query("SELECT 1 AS ok", &[])
        .await
        .is_ok();
    Json(serde_json::json!({
        "status": if storage_ok { "ok" } else { "degraded" },
        "backend": state.storage.dialect().as_str(),
    }))
}

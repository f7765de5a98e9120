use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A DSL query request.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub earliest: Option<String>,
    #[serde(default)]
    pub latest: Option<String>,
    /// Flatten structured_data into top-level row keys in the response.
    #[serde(default)]
    pub extract_fields: bool,
    /// Restrict to one app_name before any DSL filters run.
    #[serde(default)]
    pub source_type: Option<String>,
}

/// Successful query response.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub sql: String,
    pub results: Vec<Json>,
    pub count: usize,
    #[serde(rename = "executionTime_ms")]
    pub execution_time_ms: u64,
    pub backend: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Error envelope for the query surface.
#[derive(Debug, Serialize)]
pub struct QueryErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<usize>,
}

impl From<&crate::error::QueryError> for QueryErrorResponse {
    fn from(err: &crate::error::QueryError) -> Self {
        use crate::error::QueryError;
        let mut out = Self {
            error: err.kind().to_string(),
            message: err.to_string(),
            line: None,
            column: None,
            stage_index: None,
        };
        match err {
            QueryError::Parse { line, column, message } => {
                out.line = Some(*line);
                out.column = Some(*column);
                out.message = message.clone();
            }
            QueryError::Validation { stage_index, message } => {
                out.stage_index = Some(*stage_index);
                out.message = message.clone();
            }
            _ => {}
        }
        out
    }
}

/// Request body for the validation endpoint.
#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub query: String,
}

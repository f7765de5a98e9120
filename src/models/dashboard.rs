use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A panel owns one DSL query and its display configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panel {
    pub id: String,
    pub dashboard_id: String,
    pub title: String,
    pub panel_type: String,
    pub query: String,
    #[serde(default)]
    pub earliest: Option<String>,
    #[serde(default)]
    pub latest: Option<String>,
    /// Grid placement, opaque to the server.
    pub position: String,
    pub options: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A `$name$` substitution available to every panel on the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardVariable {
    pub id: String,
    pub dashboard_id: String,
    pub name: String,
    pub default_value: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A note pinned to a (field, value) pair, optionally scoped to a dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub field_name: String,
    pub field_value: String,
    pub note: String,
    pub dashboard_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateDashboardRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePanelRequest {
    pub title: String,
    #[serde(default = "default_panel_type")]
    pub panel_type: String,
    pub query: String,
    #[serde(default)]
    pub earliest: Option<String>,
    #[serde(default)]
    pub latest: Option<String>,
    #[serde(default = "default_position")]
    pub position: String,
    #[serde(default = "default_options")]
    pub options: String,
}

fn default_panel_type() -> String {
    "timeseries".to_string()
}

fn default_position() -> String {
    "{}".to_string()
}

fn default_options() -> String {
    "{}".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateVariableRequest {
    pub name: String,
    #[serde(default)]
    pub default_value: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAnnotationRequest {
    pub field_name: String,
    pub field_value: String,
    pub note: String,
    #[serde(default)]
    pub dashboard_id: Option<String>,
}

/// One executed panel in a dashboard run.
#[derive(Debug, Serialize)]
pub struct PanelResult {
    pub panel_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<crate::models::query::QueryResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::models::query::QueryErrorResponse>,
}

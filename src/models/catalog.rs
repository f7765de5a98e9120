use serde::{Deserialize, Serialize};

/// A named, retention-governed bucket of events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub retention_days: u32,
    pub created_at: String,
}

pub const MIN_RETENTION_DAYS: u32 = 1;
pub const MAX_RETENTION_DAYS: u32 = 365;
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// Index names end up in retention DDL, so the charset is strict.
pub fn valid_index_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[derive(Debug, Deserialize)]
pub struct CreateIndexRequest {
    pub name: String,
    #[serde(default = "default_retention")]
    pub retention_days: u32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateIndexRequest {
    pub retention_days: u32,
}

fn default_retention() -> u32 {
    DEFAULT_RETENTION_DAYS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: String,
    pub name: String,
    pub query: String,
    pub earliest: Option<String>,
    pub latest: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSavedSearchRequest {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub earliest: Option<String>,
    #[serde(default)]
    pub latest: Option<String>,
}

/// Per-field UI preference (pinned into the sidebar, display ordering).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPreference {
    pub id: String,
    pub field_name: String,
    pub display_name: String,
    pub pinned: bool,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct UpsertFieldPreferenceRequest {
    pub field_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreatePatternRequest {
    pub name: String,
    pub pattern: String,
    pub pattern_type: crate::extract::PatternType,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub field_prefix: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> i64 {
    100
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct TestPatternRequest {
    pub pattern: String,
    pub pattern_type: crate::extract::PatternType,
    pub sample: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_name_charset() {
        assert!(valid_index_name("default"));
        assert!(valid_index_name("web-prod_01"));
        assert!(!valid_index_name(""));
        assert!(!valid_index_name("Has Spaces"));
        assert!(!valid_index_name("UPPER"));
        assert!(!valid_index_name("inject'; DROP TABLE events;--"));
    }
}

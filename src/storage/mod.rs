pub mod clickhouse;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value as Json;

use crate::error::StorageError;
use crate::models::event::Event;

pub use self::clickhouse::ClickhouseBackend;
pub use self::sqlite::SqliteBackend;

/// Which SQL dialect a backend speaks. Placeholder syntax, interval
/// arithmetic, conditional-count shape and time bucketing all key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Columnar,
    Relational,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Columnar => "columnar",
            Dialect::Relational => "relational",
        }
    }
}

/// A typed query parameter. All user-supplied literals travel through this
/// enum; the planner never interpolates them into SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    String(String),
    UInt32(u32),
    Int32(i32),
    Float64(f64),
    StringArray(Vec<String>),
    DateTime(DateTime<Utc>),
}

impl SqlParam {
    /// The ClickHouse parameter type this value binds as.
    pub fn ch_type(&self) -> &'static str {
        match self {
            SqlParam::String(_) => "String",
            SqlParam::UInt32(_) => "UInt32",
            SqlParam::Int32(_) => "Int32",
            SqlParam::Float64(_) => "Float64",
            SqlParam::StringArray(_) => "Array(String)",
            SqlParam::DateTime(_) => "DateTime64(3)",
        }
    }
}

/// Timestamp format stored in (and bound against) the relational backend.
/// Fixed-width RFC 3339 so string comparison orders chronologically.
pub const SQLITE_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_sqlite_ts(t: DateTime<Utc>) -> String {
    t.format(SQLITE_TS_FORMAT).to_string()
}

/// A dynamic result row.
pub type Row = serde_json::Map<String, Json>;

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub occurrences: u64,
    pub samples: Vec<String>,
}

/// Capability surface shared by both warehouses. Nothing outside the
/// implementations holds a connection or a raw driver row.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Parameterized read. Rejects arity/type mismatches before touching the
    /// backend.
    async fn execute_query(&self, sql: &str, params: &[SqlParam])
        -> Result<Vec<Row>, StorageError>;

    /// One batch insert per (index, batch); a successful return means every
    /// event in the batch is visible to subsequent queries.
    async fn insert_batch(&self, index_name: &str, events: &[Event]) -> Result<(), StorageError>;

    /// Schema and retention statements.
    async fn execute_ddl(&self, sql: &str) -> Result<(), StorageError>;

    /// Walk a bounded random sample of recent events and report structured
    /// fields by descending occurrence.
    async fn discover_structured_fields(
        &self,
        window_hours: u32,
        limit: u32,
    ) -> Result<Vec<DiscoveredField>, StorageError>;
}

// ── Parameter verification ──

static CH_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{p(\d+):([A-Za-z0-9()]+)\}").unwrap());
static SQLITE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?(\d+)").unwrap());

/// Check that every placeholder in `sql` is backed by a parameter of the
/// declared type, and that no parameter is unused.
pub fn verify_params(sql: &str, params: &[SqlParam], dialect: Dialect) -> Result<(), StorageError> {
    let mut used = vec![false; params.len()];
    match dialect {
        Dialect::Columnar => {
            for cap in CH_PLACEHOLDER.captures_iter(sql) {
                let idx: usize = cap[1].parse().map_err(|_| {
                    StorageError::ParamMismatch(format!("bad placeholder {}", &cap[0]))
                })?;
                let declared = &cap[2];
                let Some(param) = params.get(idx) else {
                    return Err(StorageError::ParamMismatch(format!(
                        "placeholder p{idx} has no bound parameter"
                    )));
                };
                if param.ch_type() != declared {
                    return Err(StorageError::ParamMismatch(format!(
                        "placeholder p{idx} declared {declared} but bound {}",
                        param.ch_type()
                    )));
                }
                used[idx] = true;
            }
        }
        Dialect::Relational => {
            for cap in SQLITE_PLACEHOLDER.captures_iter(sql) {
                let n: usize = cap[1]
                    .parse()
                    .map_err(|_| StorageError::ParamMismatch("bad placeholder".to_string()))?;
                if n == 0 || n > params.len() {
                    return Err(StorageError::ParamMismatch(format!(
                        "placeholder ?{n} has no bound parameter"
                    )));
                }
                used[n - 1] = true;
            }
        }
    }
    if let Some(idx) = used.iter().position(|u| !u) {
        return Err(StorageError::ParamMismatch(format!(
            "parameter {idx} is bound but never referenced"
        )));
    }
    Ok(())
}

// ── Structured-field discovery (shared inference) ──

fn classify_value(v: &str) -> &'static str {
    let t = v.trim();
    if t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("false") {
        return "boolean";
    }
    if t.parse::<f64>().is_ok() {
        return "number";
    }
    if DateTime::parse_from_rfc3339(t).is_ok()
        || chrono::NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S").is_ok()
    {
        return "datetime";
    }
    "string"
}

/// Majority-vote field inference over sampled `structured_data` maps.
pub fn infer_fields<I>(samples: I, limit: usize) -> Vec<DiscoveredField>
where
    I: IntoIterator<Item = Vec<(String, String)>>,
{
    use std::collections::HashMap;

    struct FieldStats {
        occurrences: u64,
        votes: HashMap<&'static str, u64>,
        samples: Vec<String>,
    }

    let mut by_name: HashMap<String, FieldStats> = HashMap::new();
    for sample in samples {
        for (name, value) in sample {
            let entry = by_name.entry(name).or_insert_with(|| FieldStats {
                occurrences: 0,
                votes: HashMap::new(),
                samples: Vec::new(),
            });
            entry.occurrences += 1;
            *entry.votes.entry(classify_value(&value)).or_insert(0) += 1;
            if entry.samples.len() < 5 && !entry.samples.contains(&value) {
                entry.samples.push(value);
            }
        }
    }

    let mut out: Vec<DiscoveredField> = by_name
        .into_iter()
        .map(|(name, stats)| {
            let field_type = stats
                .votes
                .iter()
                .max_by_key(|(_, n)| **n)
                .map(|(t, _)| *t)
                .unwrap_or("string")
                .to_string();
            DiscoveredField {
                name,
                field_type,
                occurrences: stats.occurrences,
                samples: stats.samples,
            }
        })
        .collect();
    out.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then(a.name.cmp(&b.name)));
    out.truncate(limit);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_columnar_params() {
        let sql = "SELECT * FROM events WHERE hostname = {p0:String} AND severity <= {p1:UInt32}";
        let params = [SqlParam::String("web".into()), SqlParam::UInt32(3)];
        assert!(verify_params(sql, &params, Dialect::Columnar).is_ok());
    }

    #[test]
    fn verify_rejects_type_mismatch() {
        let sql = "SELECT * FROM events WHERE severity <= {p0:UInt32}";
        let params = [SqlParam::String("3".into())];
        assert!(verify_params(sql, &params, Dialect::Columnar).is_err());
    }

    #[test]
    fn verify_rejects_unused_param() {
        let sql = "SELECT * FROM events";
        let params = [SqlParam::UInt32(3)];
        assert!(verify_params(sql, &params, Dialect::Columnar).is_err());
    }

    #[test]
    fn verify_rejects_missing_relational_param() {
        let sql = "SELECT * FROM events WHERE severity <= ?2";
        let params = [SqlParam::UInt32(3)];
        assert!(verify_params(sql, &params, Dialect::Relational).is_err());
    }

    #[test]
    fn infers_majority_types() {
        let samples = vec![
            vec![("status".to_string(), "200".to_string())],
            vec![("status".to_string(), "404".to_string())],
            vec![
                ("status".to_string(), "timeout".to_string()),
                ("ok".to_string(), "true".to_string()),
            ],
        ];
        let fields = infer_fields(samples, 10);
        assert_eq!(fields[0].name, "status");
        assert_eq!(fields[0].field_type, "number");
        assert_eq!(fields[0].occurrences, 3);
        let ok = fields.iter().find(|f| f.name == "ok").unwrap();
        assert_eq!(ok.field_type, "boolean");
    }
}

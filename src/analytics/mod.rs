pub mod anomaly;
pub mod baseline;

use crate::storage::Dialect;

/// Metrics tracked per entity.
pub const METRIC_EVENT_COUNT: &str = "event_count";
pub const METRIC_ERROR_COUNT: &str = "error_count";

/// SQL expression selecting the entity id for one entity type.
pub fn entity_expr(dialect: Dialect, entity_type: &str) -> String {
    match (entity_type, dialect) {
        ("host", _) => "hostname".to_string(),
        ("app", _) => "app_name".to_string(),
        ("ip", Dialect::Columnar) => "ifNull(toString(source_ip), '')".to_string(),
        ("ip", Dialect::Relational) => "COALESCE(source_ip, '')".to_string(),
        ("user", Dialect::Columnar) => "structured_data['user']".to_string(),
        ("user", Dialect::Relational) => {
            "COALESCE(json_extract(structured_data, '$.\"user\"'), '')".to_string()
        }
        (other, _) => panic!("unknown entity type {other}"),
    }
}

/// Hour-bucketed event/error counts per entity over a window. The single
/// parameter is the window start (DateTime).
pub fn hourly_counts_sql(dialect: Dialect, entity_type: &str) -> String {
    let entity = entity_expr(dialect, entity_type);
    match dialect {
        Dialect::Columnar => format!(
            "SELECT {entity} AS entity_id, \
             toStartOfHour(timestamp) AS bucket, \
             count() AS event_count, \
             countIf(severity <= 3) AS error_count \
             FROM events \
             WHERE timestamp >= {{p0:DateTime64(3)}} AND {entity} != '' \
             GROUP BY entity_id, bucket \
             ORDER BY entity_id, bucket"
        ),
        Dialect::Relational => format!(
            "SELECT {entity} AS entity_id, \
             strftime('%Y-%m-%dT%H:00:00Z', timestamp) AS bucket, \
             COUNT(*) AS event_count, \
             SUM(CASE WHEN severity <= 3 THEN 1 ELSE 0 END) AS error_count \
             FROM events \
             WHERE timestamp >= ?1 AND {entity} != '' \
             GROUP BY entity_id, bucket \
             ORDER BY entity_id, bucket"
        ),
    }
}

/// First-seen timestamp per entity over a window (for novelty detection).
pub fn first_seen_sql(dialect: Dialect, entity_type: &str) -> String {
    let entity = entity_expr(dialect, entity_type);
    match dialect {
        Dialect::Columnar => format!(
            "SELECT {entity} AS entity_id, min(timestamp) AS first_seen \
             FROM events WHERE timestamp >= {{p0:DateTime64(3)}} AND {entity} != '' \
             GROUP BY entity_id"
        ),
        Dialect::Relational => format!(
            "SELECT {entity} AS entity_id, MIN(timestamp) AS first_seen \
             FROM events WHERE timestamp >= ?1 AND {entity} != '' \
             GROUP BY entity_id"
        ),
    }
}

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value as Json;

use crate::error::StorageError;
use crate::models::event::Event;
use crate::storage::{
    format_sqlite_ts, verify_params, Dialect, DiscoveredField, Row, SqlParam, StorageBackend,
};

/// SQLite has no REGEXP implementation out of the box; back the operator
/// with the shared compiled-pattern cache.
fn register_regexp(conn: &Connection) -> Result<(), StorageError> {
    use rusqlite::functions::FunctionFlags;
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: String = ctx.get(0)?;
            let text: String = ctx.get(1)?;
            Ok(crate::extract::grok::cached_regex(&pattern)
                .map(|re| re.is_match(&text))
                .unwrap_or(false))
        },
    )
    .map_err(|e| StorageError::Connection(e.to_string()))
}

/// Embedded relational backend. One connection behind a mutex, every call
/// hopping to the blocking pool; fine for homelab write rates.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn =
            Connection::open(path).map_err(|e| StorageError::Connection(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        register_regexp(&conn)?;
        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        backend.run_migrations()?;
        Ok(backend)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(":memory:")
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                timestamp       TEXT NOT NULL,
                received_at     TEXT NOT NULL,
                hostname        TEXT NOT NULL DEFAULT '',
                app_name        TEXT NOT NULL DEFAULT '',
                message         TEXT NOT NULL DEFAULT '',
                severity        INTEGER NOT NULL,
                facility        INTEGER NOT NULL,
                priority        INTEGER NOT NULL,
                source_ip       TEXT,
                source_port     INTEGER,
                protocol        TEXT NOT NULL DEFAULT '',
                index_name      TEXT NOT NULL DEFAULT 'default',
                raw             TEXT NOT NULL DEFAULT '',
                structured_data TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_events_index_ts ON events(index_name, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(timestamp);
            ",
        )
        .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(())
    }

    fn to_sql_value(p: &SqlParam) -> rusqlite::types::Value {
        use rusqlite::types::Value;
        match p {
            SqlParam::String(s) => Value::Text(s.clone()),
            SqlParam::UInt32(v) => Value::Integer(*v as i64),
            SqlParam::Int32(v) => Value::Integer(*v as i64),
            SqlParam::Float64(v) => Value::Real(*v),
            SqlParam::StringArray(items) => {
                Value::Text(serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()))
            }
            SqlParam::DateTime(t) => Value::Text(format_sqlite_ts(*t)),
        }
    }

    fn value_to_json(v: ValueRef<'_>) -> Json {
        match v {
            ValueRef::Null => Json::Null,
            ValueRef::Integer(i) => Json::Number(i.into()),
            ValueRef::Real(x) => serde_json::Number::from_f64(x)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            ValueRef::Text(t) => Json::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(_) => Json::Null,
        }
    }

    fn query_blocking(
        conn: &Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Row>, StorageError> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StorageError::Query(e.to_string()))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let values: Vec<rusqlite::types::Value> = params.iter().map(Self::to_sql_value).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(values))
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| StorageError::Query(e.to_string()))? {
            let mut obj = Row::new();
            for (i, name) in columns.iter().enumerate() {
                let mut v = Self::value_to_json(row.get_ref(i).map_err(|e| {
                    StorageError::Query(e.to_string())
                })?);
                // Stored JSON objects (structured_data, json_group_array
                // results) come back as text; surface them structurally so
                // both dialects agree.
                if let Json::String(s) = &v {
                    let t = s.trim_start();
                    if (name == "structured_data" || name.starts_with("__arr_"))
                        && (t.starts_with('{') || t.starts_with('['))
                    {
                        if let Ok(parsed) = serde_json::from_str::<Json>(s) {
                            v = parsed;
                        }
                    }
                }
                obj.insert(name.clone(), v);
            }
            out.push(obj);
        }
        Ok(out)
    }

    fn insert_blocking(
        conn: &mut Connection,
        index_name: &str,
        events: &[Event],
    ) -> Result<(), StorageError> {
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Insert(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO events (timestamp, received_at, hostname, app_name, message, \
                     severity, facility, priority, source_ip, source_port, protocol, index_name, \
                     raw, structured_data) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .map_err(|e| StorageError::Insert(e.to_string()))?;
            for e in events {
                let structured = serde_json::to_string(&e.structured_data)
                    .unwrap_or_else(|_| "{}".to_string());
                stmt.execute(rusqlite::params![
                    format_sqlite_ts(e.timestamp),
                    format_sqlite_ts(e.received_at),
                    e.hostname,
                    e.app_name,
                    e.message,
                    e.severity,
                    e.facility,
                    e.priority(),
                    e.source_ip.map(|ip| ip.to_string()),
                    e.source_port,
                    e.protocol,
                    index_name,
                    e.raw,
                    structured,
                ])
                .map_err(|err| StorageError::Insert(err.to_string()))?;
            }
        }
        tx.commit().map_err(|e| StorageError::Insert(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Relational
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Row>, StorageError> {
        verify_params(sql, params, Dialect::Relational)?;
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            Self::query_blocking(&conn, &sql, &params)
        })
        .await
        .map_err(|e| StorageError::Query(format!("worker join error: {e}")))?
    }

    async fn insert_batch(&self, index_name: &str, events: &[Event]) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let index_name = index_name.to_string();
        let events = events.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            Self::insert_blocking(&mut conn, &index_name, &events)
        })
        .await
        .map_err(|e| StorageError::Insert(format!("worker join error: {e}")))?
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute_batch(&sql)
                .map_err(|e| StorageError::Query(e.to_string()))
        })
        .await
        .map_err(|e| StorageError::Query(format!("worker join error: {e}")))?
    }

    async fn discover_structured_fields(
        &self,
        window_hours: u32,
        limit: u32,
    ) -> Result<Vec<DiscoveredField>, StorageError> {
        let cutoff = Utc::now() - Duration::hours(window_hours as i64);
        let sql = format!(
            "SELECT structured_data FROM events WHERE timestamp >= ?1 \
             ORDER BY RANDOM() LIMIT {limit}"
        );
        let rows = self
            .execute_query(&sql, &[SqlParam::DateTime(cutoff)])
            .await?;
        let samples = rows.into_iter().map(|row| match row.get("structured_data") {
            Some(Json::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), crate::dsl::eval::as_string(v)))
                .collect(),
            _ => Vec::new(),
        });
        Ok(crate::storage::infer_fields(samples, limit as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::DEFAULT_INDEX;

    fn sample_event(host: &str, severity: u8) -> Event {
        let mut e = Event::default();
        e.hostname = host.to_string();
        e.severity = severity;
        e.message = format!("hello from {host}");
        e.structured_data
            .insert("status".to_string(), "200".to_string());
        e
    }

    #[tokio::test]
    async fn insert_and_query_round_trip() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let events = vec![sample_event("web-01", 3), sample_event("db", 2)];
        backend.insert_batch(DEFAULT_INDEX, &events).await.unwrap();

        let rows = backend
            .execute_query(
                "SELECT hostname, severity, structured_data FROM events \
                 WHERE hostname = ?1",
                &[SqlParam::String("web-01".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["hostname"], "web-01");
        assert_eq!(rows[0]["severity"], 3);
        assert_eq!(rows[0]["structured_data"]["status"], "200");
    }

    #[tokio::test]
    async fn rejects_unbound_placeholder() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let err = backend
            .execute_query("SELECT * FROM events WHERE hostname = ?1", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ParamMismatch(_)));
    }

    #[tokio::test]
    async fn discovery_reports_majority_types() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let events: Vec<Event> = (0..5).map(|i| sample_event("h", i)).collect();
        backend.insert_batch(DEFAULT_INDEX, &events).await.unwrap();
        let fields = backend.discover_structured_fields(24, 100).await.unwrap();
        let status = fields.iter().find(|f| f.name == "status").unwrap();
        assert_eq!(status.field_type, "number");
        assert_eq!(status.occurrences, 5);
    }
}

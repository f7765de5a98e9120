use async_trait::async_trait;

use crate::error::StorageError;
use crate::models::event::{Event, EventRow};
use crate::storage::{
    verify_params, Dialect, DiscoveredField, Row, SqlParam, StorageBackend,
};

/// Idempotent schema statements, run on every startup.
const MIGRATIONS: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS events
(
    timestamp        DateTime64(3, 'UTC') CODEC(Delta, ZSTD(1)),
    received_at      DateTime64(3, 'UTC') CODEC(Delta, ZSTD(1)),
    hostname         LowCardinality(String),
    app_name         LowCardinality(String),
    message          String,
    severity         UInt8,
    facility         UInt8,
    priority         UInt8,
    source_ip        Nullable(IPv6),
    source_port      Nullable(UInt16),
    protocol         LowCardinality(String),
    index_name       LowCardinality(String),
    raw              String CODEC(ZSTD(3)),
    structured_data  Map(String, String)
)
ENGINE = MergeTree()
PARTITION BY toDate(timestamp)
ORDER BY (index_name, timestamp)
SETTINGS index_granularity = 8192",
];

/// Columnar warehouse backend. Typed inserts go through the native client
/// (RowBinary); dynamic SELECTs and DDL go over the HTTP interface with
/// server-side `{pN:Type}` parameter binding so user values never touch the
/// SQL text.
pub struct ClickhouseBackend {
    client: clickhouse::Client,
    http: reqwest::Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl ClickhouseBackend {
    pub fn new(url: &str, database: &str, user: &str, password: &str) -> Self {
        let client = clickhouse::Client::default()
            .with_url(url)
            .with_database(database)
            .with_user(user)
            .with_password(password);
        Self {
            client,
            http: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// Ensure the database and events table exist.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        self.http_exec(
            &format!("CREATE DATABASE IF NOT EXISTS {}", self.database),
            &[],
            false,
        )
        .await?;
        for sql in MIGRATIONS {
            self.http_exec(sql, &[], true).await?;
        }
        tracing::info!("clickhouse migrations applied ({} statements)", MIGRATIONS.len());
        Ok(())
    }

    fn encode_param(p: &SqlParam) -> String {
        match p {
            SqlParam::String(s) => s.clone(),
            SqlParam::UInt32(v) => v.to_string(),
            SqlParam::Int32(v) => v.to_string(),
            SqlParam::Float64(v) => v.to_string(),
            SqlParam::StringArray(items) => {
                let quoted: Vec<String> = items
                    .iter()
                    .map(|s| format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")))
                    .collect();
                format!("[{}]", quoted.join(","))
            }
            SqlParam::DateTime(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }

    async fn http_exec(
        &self,
        sql: &str,
        params: &[SqlParam],
        with_db: bool,
    ) -> Result<String, StorageError> {
        let mut query: Vec<(String, String)> = Vec::new();
        if with_db {
            query.push(("database".to_string(), self.database.clone()));
        }
        // RFC 3339 timestamps in result sets, matching the relational dialect,
        // and plain JSON numbers for 64-bit integers.
        query.push(("date_time_output_format".to_string(), "iso".to_string()));
        query.push((
            "output_format_json_quote_64bit_integers".to_string(),
            "0".to_string(),
        ));
        for (i, p) in params.iter().enumerate() {
            query.push((format!("param_p{i}"), Self::encode_param(p)));
        }

        let resp = self
            .http
            .post(&self.url)
            .query(&query)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        if !status.is_success() {
            return Err(StorageError::Query(body.trim().to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl StorageBackend for ClickhouseBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Columnar
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Row>, StorageError> {
        verify_params(sql, params, Dialect::Columnar)?;
        let sql = format!("{sql} FORMAT JSONEachRow");
        let body = self.http_exec(&sql, params, true).await?;
        let mut rows = Vec::new();
        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row: Row = serde_json::from_str(line)
                .map_err(|e| StorageError::Query(format!("bad result row: {e}")))?;
            rows.push(row);
        }
        Ok(rows)
    }

    async fn insert_batch(&self, index_name: &str, events: &[Event]) -> Result<(), StorageError> {
        let mut insert = self
            .client
            .insert("events")
            .map_err(|e| StorageError::Insert(e.to_string()))?;
        for event in events {
            let mut row = EventRow::from(event);
            row.index_name = index_name.to_string();
            insert
                .write(&row)
                .await
                .map_err(|e| StorageError::Insert(e.to_string()))?;
        }
        insert
            .end()
            .await
            .map_err(|e| StorageError::Insert(e.to_string()))?;
        Ok(())
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), StorageError> {
        self.http_exec(sql, &[], true).await?;
        Ok(())
    }

    async fn discover_structured_fields(
        &self,
        window_hours: u32,
        limit: u32,
    ) -> Result<Vec<DiscoveredField>, StorageError> {
        let sql = format!(
            "SELECT structured_data FROM events \
             WHERE timestamp >= now64(3) - INTERVAL {window_hours} HOUR \
             ORDER BY rand() LIMIT {limit}"
        );
        let rows = self.execute_query(&sql, &[]).await?;
        let samples = rows.into_iter().map(|row| {
            match row.get("structured_data") {
                Some(serde_json::Value::Object(map)) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), crate::dsl::eval::as_string(v)))
                    .collect(),
                _ => Vec::new(),
            }
        });
        Ok(crate::storage::infer_fields(samples, limit as usize))
    }
}

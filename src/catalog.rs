use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::extract::{PatternType, UserPattern};
use crate::models::anomaly::{AnomalyRecord, AnomalySummary, Baseline};
use crate::models::catalog::{
    FieldPreference, IndexInfo, SavedSearch, DEFAULT_RETENTION_DAYS, MAX_RETENTION_DAYS,
    MIN_RETENTION_DAYS,
};
use crate::models::dashboard::{Annotation, Dashboard, DashboardVariable, Panel};

fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Catalog store: indexes, dashboards, saved searches, field preferences,
/// extraction patterns, baselines and anomalies. SQLite behind one mutex.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.run_migrations()?;
        Ok(catalog)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::open(":memory:")
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS indexes (
                name            TEXT PRIMARY KEY,
                retention_days  INTEGER NOT NULL DEFAULT 90,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS dashboards (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS panels (
                id           TEXT PRIMARY KEY,
                dashboard_id TEXT NOT NULL REFERENCES dashboards(id) ON DELETE CASCADE,
                title        TEXT NOT NULL,
                panel_type   TEXT NOT NULL DEFAULT 'timeseries',
                query        TEXT NOT NULL,
                earliest     TEXT,
                latest       TEXT,
                position     TEXT NOT NULL DEFAULT '{}',
                options      TEXT NOT NULL DEFAULT '{}',
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_panels_dashboard ON panels(dashboard_id);

            CREATE TABLE IF NOT EXISTS dashboard_variables (
                id            TEXT PRIMARY KEY,
                dashboard_id  TEXT NOT NULL REFERENCES dashboards(id) ON DELETE CASCADE,
                name          TEXT NOT NULL,
                default_value TEXT NOT NULL DEFAULT '',
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                UNIQUE(dashboard_id, name)
            );

            CREATE TABLE IF NOT EXISTS annotations (
                id           TEXT PRIMARY KEY,
                field_name   TEXT NOT NULL,
                field_value  TEXT NOT NULL,
                note         TEXT NOT NULL,
                dashboard_id TEXT REFERENCES dashboards(id) ON DELETE CASCADE,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_annotations_field ON annotations(field_name, field_value);

            CREATE TABLE IF NOT EXISTS saved_searches (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                query      TEXT NOT NULL,
                earliest   TEXT,
                latest     TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS field_preferences (
                id           TEXT PRIMARY KEY,
                field_name   TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL DEFAULT '',
                pinned       INTEGER NOT NULL DEFAULT 0,
                sort_order   INTEGER NOT NULL DEFAULT 0,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS extraction_patterns (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL UNIQUE,
                pattern      TEXT NOT NULL,
                pattern_type TEXT NOT NULL CHECK(pattern_type IN ('regex','grok')),
                priority     INTEGER NOT NULL DEFAULT 100,
                field_prefix TEXT,
                enabled      INTEGER NOT NULL DEFAULT 1,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS baselines (
                entity_type  TEXT NOT NULL,
                entity_id    TEXT NOT NULL,
                metric_name  TEXT NOT NULL,
                hour_of_day  INTEGER NOT NULL,
                day_of_week  INTEGER NOT NULL,
                mean         REAL NOT NULL,
                stddev       REAL NOT NULL,
                sample_count INTEGER NOT NULL,
                updated_at   TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id, metric_name, hour_of_day, day_of_week)
            );

            CREATE TABLE IF NOT EXISTS anomalies (
                id                TEXT PRIMARY KEY,
                timestamp         TEXT NOT NULL,
                entity_type       TEXT NOT NULL,
                entity_id         TEXT NOT NULL,
                anomaly_type      TEXT NOT NULL,
                metric_name       TEXT NOT NULL,
                observed          REAL NOT NULL,
                expected          REAL,
                deviation_score   REAL NOT NULL,
                risk_score        INTEGER NOT NULL,
                severity          TEXT NOT NULL CHECK(severity IN ('low','medium','high','critical')),
                related_logs      TEXT NOT NULL DEFAULT '[]',
                context           TEXT NOT NULL DEFAULT '{}',
                is_false_positive INTEGER NOT NULL DEFAULT 0,
                feedback_at       TEXT,
                created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_anomalies_ts ON anomalies(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_anomalies_entity ON anomalies(entity_type, entity_id);
            ",
        )?;
        Ok(())
    }

    // ── Index operations ──

    pub fn list_indexes(&self) -> anyhow::Result<Vec<IndexInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name, retention_days, created_at FROM indexes ORDER BY name ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IndexInfo {
                    name: row.get(0)?,
                    retention_days: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_index(&self, name: &str) -> anyhow::Result<Option<IndexInfo>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT name, retention_days, created_at FROM indexes WHERE name = ?1",
                params![name],
                |row| {
                    Ok(IndexInfo {
                        name: row.get(0)?,
                        retention_days: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Create the index row on first sight with default retention.
    pub fn ensure_index(&self, name: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO indexes (name, retention_days) VALUES (?1, ?2)",
            params![name, DEFAULT_RETENTION_DAYS],
        )?;
        Ok(())
    }

    pub fn create_index(&self, name: &str, retention_days: u32) -> anyhow::Result<()> {
        let retention = retention_days.clamp(MIN_RETENTION_DAYS, MAX_RETENTION_DAYS);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO indexes (name, retention_days) VALUES (?1, ?2)",
            params![name, retention],
        )?;
        Ok(())
    }

    pub fn update_index_retention(&self, name: &str, retention_days: u32) -> anyhow::Result<bool> {
        let retention = retention_days.clamp(MIN_RETENTION_DAYS, MAX_RETENTION_DAYS);
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE indexes SET retention_days = ?2 WHERE name = ?1",
            params![name, retention],
        )?;
        Ok(count > 0)
    }

    pub fn delete_index(&self, name: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM indexes WHERE name = ?1", params![name])?;
        Ok(count > 0)
    }

    // ── Dashboard operations ──

    pub fn list_dashboards(&self) -> anyhow::Result<Vec<Dashboard>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created_at, updated_at FROM dashboards \
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Dashboard {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_dashboard(&self, id: &str) -> anyhow::Result<Option<Dashboard>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at FROM dashboards WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Dashboard {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn create_dashboard(&self, id: &str, name: &str, description: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dashboards (id, name, description) VALUES (?1, ?2, ?3)",
            params![id, name, description],
        )?;
        Ok(())
    }

    pub fn update_dashboard(&self, id: &str, name: &str, description: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE dashboards SET name = ?2, description = ?3, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
            params![id, name, description],
        )?;
        Ok(count > 0)
    }

    /// Panels, variables and scoped annotations cascade.
    pub fn delete_dashboard(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM dashboards WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    // ── Panel operations ──

    pub fn list_panels(&self, dashboard_id: &str) -> anyhow::Result<Vec<Panel>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, dashboard_id, title, panel_type, query, earliest, latest, position, \
             options, created_at, updated_at \
             FROM panels WHERE dashboard_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![dashboard_id], |row| {
                Ok(Panel {
                    id: row.get(0)?,
                    dashboard_id: row.get(1)?,
                    title: row.get(2)?,
                    panel_type: row.get(3)?,
                    query: row.get(4)?,
                    earliest: row.get(5)?,
                    latest: row.get(6)?,
                    position: row.get(7)?,
                    options: row.get(8)?,
                    created_at: row.get(9)?,
                    updated_at: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_panel(
        &self,
        id: &str,
        dashboard_id: &str,
        title: &str,
        panel_type: &str,
        query: &str,
        earliest: Option<&str>,
        latest: Option<&str>,
        position: &str,
        options: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO panels (id, dashboard_id, title, panel_type, query, earliest, latest, \
             position, options) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![id, dashboard_id, title, panel_type, query, earliest, latest, position, options],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_panel(
        &self,
        id: &str,
        dashboard_id: &str,
        title: &str,
        panel_type: &str,
        query: &str,
        earliest: Option<&str>,
        latest: Option<&str>,
        position: &str,
        options: &str,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE panels SET title = ?3, panel_type = ?4, query = ?5, earliest = ?6, \
             latest = ?7, position = ?8, options = ?9, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') \
             WHERE id = ?1 AND dashboard_id = ?2",
            params![id, dashboard_id, title, panel_type, query, earliest, latest, position, options],
        )?;
        Ok(count > 0)
    }

    pub fn delete_panel(&self, id: &str, dashboard_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM panels WHERE id = ?1 AND dashboard_id = ?2",
            params![id, dashboard_id],
        )?;
        Ok(count > 0)
    }

    // ── Dashboard variables ──

    pub fn list_variables(&self, dashboard_id: &str) -> anyhow::Result<Vec<DashboardVariable>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, dashboard_id, name, default_value, created_at, updated_at \
             FROM dashboard_variables WHERE dashboard_id = ?1 ORDER BY name ASC",
        )?;
        let rows = stmt
            .query_map(params![dashboard_id], |row| {
                Ok(DashboardVariable {
                    id: row.get(0)?,
                    dashboard_id: row.get(1)?,
                    name: row.get(2)?,
                    default_value: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_variable(
        &self,
        id: &str,
        dashboard_id: &str,
        name: &str,
        default_value: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dashboard_variables (id, dashboard_id, name, default_value) \
             VALUES (?1, ?2, ?3, ?4)",
            params![id, dashboard_id, name, default_value],
        )?;
        Ok(())
    }

    pub fn delete_variable(&self, id: &str, dashboard_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM dashboard_variables WHERE id = ?1 AND dashboard_id = ?2",
            params![id, dashboard_id],
        )?;
        Ok(count > 0)
    }

    // ── Annotations ──

    pub fn list_annotations(
        &self,
        field_name: Option<&str>,
        field_value: Option<&str>,
    ) -> anyhow::Result<Vec<Annotation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, field_name, field_value, note, dashboard_id, created_at, updated_at \
             FROM annotations \
             WHERE (?1 IS NULL OR field_name = ?1) AND (?2 IS NULL OR field_value = ?2) \
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![field_name, field_value], |row| {
                Ok(Annotation {
                    id: row.get(0)?,
                    field_name: row.get(1)?,
                    field_value: row.get(2)?,
                    note: row.get(3)?,
                    dashboard_id: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_annotation(
        &self,
        id: &str,
        field_name: &str,
        field_value: &str,
        note: &str,
        dashboard_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO annotations (id, field_name, field_value, note, dashboard_id) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, field_name, field_value, note, dashboard_id],
        )?;
        Ok(())
    }

    pub fn delete_annotation(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM annotations WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    // ── Saved searches ──

    pub fn list_saved_searches(&self) -> anyhow::Result<Vec<SavedSearch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, query, earliest, latest, created_at, updated_at \
             FROM saved_searches ORDER BY name ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SavedSearch {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    query: row.get(2)?,
                    earliest: row.get(3)?,
                    latest: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_saved_search(
        &self,
        id: &str,
        name: &str,
        query: &str,
        earliest: Option<&str>,
        latest: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO saved_searches (id, name, query, earliest, latest) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, query, earliest, latest],
        )?;
        Ok(())
    }

    pub fn delete_saved_search(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM saved_searches WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    // ── Field preferences ──

    pub fn list_field_preferences(&self) -> anyhow::Result<Vec<FieldPreference>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, field_name, display_name, pinned, sort_order, created_at, updated_at \
             FROM field_preferences ORDER BY sort_order ASC, field_name ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FieldPreference {
                    id: row.get(0)?,
                    field_name: row.get(1)?,
                    display_name: row.get(2)?,
                    pinned: row.get::<_, i64>(3)? != 0,
                    sort_order: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_field_preference(
        &self,
        id: &str,
        field_name: &str,
        display_name: &str,
        pinned: bool,
        sort_order: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO field_preferences (id, field_name, display_name, pinned, sort_order) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(field_name) DO UPDATE SET display_name = ?3, pinned = ?4, \
             sort_order = ?5, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
            params![id, field_name, display_name, pinned as i64, sort_order],
        )?;
        Ok(())
    }

    // ── Extraction patterns ──

    pub fn list_patterns(&self) -> anyhow::Result<Vec<UserPattern>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, pattern, pattern_type, priority, field_prefix, enabled \
             FROM extraction_patterns ORDER BY priority ASC, name ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let ty: String = row.get(3)?;
                Ok(UserPattern {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    pattern: row.get(2)?,
                    pattern_type: if ty == "grok" {
                        PatternType::Grok
                    } else {
                        PatternType::Regex
                    },
                    priority: row.get(4)?,
                    field_prefix: row.get(5)?,
                    enabled: row.get::<_, i64>(6)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_pattern(
        &self,
        id: &str,
        name: &str,
        pattern: &str,
        pattern_type: PatternType,
        priority: i64,
        field_prefix: Option<&str>,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let ty = match pattern_type {
            PatternType::Regex => "regex",
            PatternType::Grok => "grok",
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO extraction_patterns (id, name, pattern, pattern_type, priority, \
             field_prefix, enabled) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, name, pattern, ty, priority, field_prefix, enabled as i64],
        )?;
        Ok(())
    }

    pub fn delete_pattern(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM extraction_patterns WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    // ── Baselines ──

    /// Full-rebuild write path: replace every baseline for one entity type in
    /// a single transaction.
    pub fn replace_baselines(
        &self,
        entity_type: &str,
        baselines: &[Baseline],
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM baselines WHERE entity_type = ?1",
            params![entity_type],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO baselines (entity_type, entity_id, metric_name, hour_of_day, \
                 day_of_week, mean, stddev, sample_count, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for b in baselines {
                stmt.execute(params![
                    b.entity_type,
                    b.entity_id,
                    b.metric_name,
                    b.hour_of_day,
                    b.day_of_week,
                    b.mean,
                    b.stddev,
                    b.sample_count,
                    b.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_baseline(
        &self,
        entity_type: &str,
        entity_id: &str,
        metric_name: &str,
        hour_of_day: u32,
        day_of_week: u32,
    ) -> anyhow::Result<Option<Baseline>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT entity_type, entity_id, metric_name, hour_of_day, day_of_week, mean, \
                 stddev, sample_count, updated_at FROM baselines \
                 WHERE entity_type = ?1 AND entity_id = ?2 AND metric_name = ?3 \
                 AND hour_of_day = ?4 AND day_of_week = ?5",
                params![entity_type, entity_id, metric_name, hour_of_day, day_of_week],
                baseline_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every hour-of-week cell for one (entity, metric), for the all-hours
    /// fallback aggregate.
    pub fn baselines_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        metric_name: &str,
    ) -> anyhow::Result<Vec<Baseline>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entity_type, entity_id, metric_name, hour_of_day, day_of_week, mean, \
             stddev, sample_count, updated_at FROM baselines \
             WHERE entity_type = ?1 AND entity_id = ?2 AND metric_name = ?3",
        )?;
        let rows = stmt
            .query_map(params![entity_type, entity_id, metric_name], baseline_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Anomalies ──

    pub fn insert_anomaly(&self, a: &AnomalyRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO anomalies (id, timestamp, entity_type, entity_id, anomaly_type, \
             metric_name, observed, expected, deviation_score, risk_score, severity, \
             related_logs, context, is_false_positive, feedback_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, NULL, ?14)",
            params![
                a.id,
                a.timestamp,
                a.entity_type,
                a.entity_id,
                a.anomaly_type,
                a.metric_name,
                a.observed,
                a.expected,
                a.deviation_score,
                a.risk_score,
                a.severity,
                a.related_logs,
                a.context,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn list_anomalies(
        &self,
        entity_type: Option<&str>,
        severity: Option<&str>,
        include_false_positives: bool,
        limit: u32,
    ) -> anyhow::Result<Vec<AnomalyRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, entity_type, entity_id, anomaly_type, metric_name, observed, \
             expected, deviation_score, risk_score, severity, related_logs, context, \
             is_false_positive, feedback_at, created_at \
             FROM anomalies \
             WHERE (?1 IS NULL OR entity_type = ?1) AND (?2 IS NULL OR severity = ?2) \
             AND (?3 OR is_false_positive = 0) \
             ORDER BY timestamp DESC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![entity_type, severity, include_false_positives, limit],
                anomaly_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark or clear operator feedback on one anomaly.
    pub fn set_anomaly_feedback(&self, id: &str, is_false_positive: bool) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE anomalies SET is_false_positive = ?2, \
             feedback_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
            params![id, is_false_positive as i64],
        )?;
        Ok(count > 0)
    }

    /// Severity counts since a timestamp, excluding rows flagged as false
    /// positives.
    pub fn anomaly_summary(&self, since: &str) -> anyhow::Result<AnomalySummary> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*), \
             SUM(CASE WHEN severity = 'low' THEN 1 ELSE 0 END), \
             SUM(CASE WHEN severity = 'medium' THEN 1 ELSE 0 END), \
             SUM(CASE WHEN severity = 'high' THEN 1 ELSE 0 END), \
             SUM(CASE WHEN severity = 'critical' THEN 1 ELSE 0 END) \
             FROM anomalies WHERE timestamp >= ?1 AND is_false_positive = 0",
            params![since],
            |row| {
                Ok(AnomalySummary {
                    total: row.get::<_, Option<u64>>(0)?.unwrap_or(0),
                    low: row.get::<_, Option<u64>>(1)?.unwrap_or(0),
                    medium: row.get::<_, Option<u64>>(2)?.unwrap_or(0),
                    high: row.get::<_, Option<u64>>(3)?.unwrap_or(0),
                    critical: row.get::<_, Option<u64>>(4)?.unwrap_or(0),
                })
            },
        )
        .map_err(Into::into)
    }
}

fn baseline_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Baseline> {
    Ok(Baseline {
        entity_type: row.get(0)?,
        entity_id: row.get(1)?,
        metric_name: row.get(2)?,
        hour_of_day: row.get(3)?,
        day_of_week: row.get(4)?,
        mean: row.get(5)?,
        stddev: row.get(6)?,
        sample_count: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn anomaly_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnomalyRecord> {
    Ok(AnomalyRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        anomaly_type: row.get(4)?,
        metric_name: row.get(5)?,
        observed: row.get(6)?,
        expected: row.get(7)?,
        deviation_score: row.get(8)?,
        risk_score: row.get(9)?,
        severity: row.get(10)?,
        related_logs: row.get(11)?,
        context: row.get(12)?,
        is_false_positive: row.get::<_, i64>(13)? != 0,
        feedback_at: row.get(14)?,
        created_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_anomaly(id: &str, severity: &str) -> AnomalyRecord {
        AnomalyRecord {
            id: id.to_string(),
            timestamp: "2023-10-10T13:00:00Z".to_string(),
            entity_type: "host".to_string(),
            entity_id: "web-01".to_string(),
            anomaly_type: "spike".to_string(),
            metric_name: "event_count".to_string(),
            observed: 120.0,
            expected: Some(20.0),
            deviation_score: 5.0,
            risk_score: 60,
            severity: severity.to_string(),
            related_logs: "[]".to_string(),
            context: "{}".to_string(),
            is_false_positive: false,
            feedback_at: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn index_lifecycle() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.ensure_index("default").unwrap();
        catalog.ensure_index("default").unwrap();
        let idx = catalog.get_index("default").unwrap().unwrap();
        assert_eq!(idx.retention_days, DEFAULT_RETENTION_DAYS);

        catalog.create_index("web", 30).unwrap();
        assert!(catalog.update_index_retention("web", 7).unwrap());
        assert_eq!(catalog.get_index("web").unwrap().unwrap().retention_days, 7);
        // Retention clamps into 1..=365.
        catalog.update_index_retention("web", 9999).unwrap();
        assert_eq!(
            catalog.get_index("web").unwrap().unwrap().retention_days,
            MAX_RETENTION_DAYS
        );
    }

    #[test]
    fn dashboard_cascade_deletes_children() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.create_dashboard("d1", "Ops", "").unwrap();
        catalog
            .create_panel("p1", "d1", "Errors", "timeseries", "search severity<=3", None, None, "{}", "{}")
            .unwrap();
        catalog.create_variable("v1", "d1", "host", "*").unwrap();
        catalog
            .create_annotation("a1", "hostname", "web-01", "flaky PSU", Some("d1"))
            .unwrap();

        assert!(catalog.delete_dashboard("d1").unwrap());
        assert!(catalog.list_panels("d1").unwrap().is_empty());
        assert!(catalog.list_variables("d1").unwrap().is_empty());
        assert!(catalog.list_annotations(None, None).unwrap().is_empty());
    }

    #[test]
    fn unscoped_annotations_survive_dashboard_delete() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.create_dashboard("d1", "Ops", "").unwrap();
        catalog
            .create_annotation("a1", "hostname", "db", "prod primary", None)
            .unwrap();
        catalog.delete_dashboard("d1").unwrap();
        assert_eq!(catalog.list_annotations(None, None).unwrap().len(), 1);
    }

    #[test]
    fn baseline_replace_and_lookup() {
        let catalog = Catalog::open_in_memory().unwrap();
        let cell = Baseline {
            entity_type: "host".to_string(),
            entity_id: "web-01".to_string(),
            metric_name: "event_count".to_string(),
            hour_of_day: 13,
            day_of_week: 1,
            mean: 42.0,
            stddev: 5.0,
            sample_count: 10,
            updated_at: "2023-10-10T00:00:00Z".to_string(),
        };
        catalog.replace_baselines("host", &[cell.clone()]).unwrap();
        let got = catalog
            .get_baseline("host", "web-01", "event_count", 13, 1)
            .unwrap()
            .unwrap();
        assert_eq!(got, cell);
        assert!(catalog
            .get_baseline("host", "web-01", "event_count", 2, 1)
            .unwrap()
            .is_none());

        // A rebuild replaces, not accumulates.
        catalog.replace_baselines("host", &[]).unwrap();
        assert!(catalog
            .baselines_for_entity("host", "web-01", "event_count")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn anomaly_feedback_excluded_from_summary() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.insert_anomaly(&sample_anomaly("a1", "medium")).unwrap();
        catalog.insert_anomaly(&sample_anomaly("a2", "critical")).unwrap();
        assert!(catalog.set_anomaly_feedback("a2", true).unwrap());

        let summary = catalog.anomaly_summary("2023-01-01T00:00:00Z").unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.medium, 1);
        assert_eq!(summary.critical, 0);

        let visible = catalog.list_anomalies(None, None, false, 100).unwrap();
        assert_eq!(visible.len(), 1);
        let all = catalog.list_anomalies(None, None, true, 100).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|a| a.is_false_positive && a.feedback_at.is_some()));
    }

    #[test]
    fn extraction_pattern_ordering() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .create_pattern("p2", "zeta", "b=(?P<b>\\d+)", PatternType::Regex, 10, None, true)
            .unwrap();
        catalog
            .create_pattern("p1", "alpha", "a=(?P<a>\\d+)", PatternType::Regex, 10, None, true)
            .unwrap();
        catalog
            .create_pattern("p3", "early", "%{IP:ip}", PatternType::Grok, 1, None, true)
            .unwrap();
        let patterns = catalog.list_patterns().unwrap();
        let names: Vec<&str> = patterns.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["early", "alpha", "zeta"]);
    }
}

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::catalog::Catalog;
use crate::config::RetentionConfig;
use crate::models::catalog::valid_index_name;
use crate::storage::{Dialect, StorageBackend};

/// Deletes expired events per index on a schedule. Passes for the same index
/// are coalesced; different indexes may run concurrently.
pub struct RetentionEnforcer {
    storage: Arc<dyn StorageBackend>,
    catalog: Arc<Catalog>,
    in_flight: Mutex<HashSet<String>>,
}

impl RetentionEnforcer {
    pub fn new(storage: Arc<dyn StorageBackend>, catalog: Arc<Catalog>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            catalog,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Spawn the hourly enforcement loop (fire-and-forget).
    pub fn spawn(self: &Arc<Self>, config: RetentionConfig, mut shutdown: watch::Receiver<bool>) {
        if !config.enabled {
            tracing::info!("retention enforcer: disabled by config");
            return;
        }
        let enforcer = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "retention enforcer: started (interval={}s)",
                config.interval_secs
            );
            let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = enforcer.run_once().await {
                            tracing::error!("retention enforcer error: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("retention enforcer: shutting down");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// One enforcement pass over every known index.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        self.adopt_unseen_indexes().await?;

        for index in self.catalog.list_indexes()? {
            if !valid_index_name(&index.name) {
                tracing::warn!("retention: skipping index with invalid name {:?}", index.name);
                continue;
            }
            // Coalesce concurrent passes for the same index.
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if !in_flight.insert(index.name.clone()) {
                    tracing::debug!("retention: pass for '{}' already running", index.name);
                    continue;
                }
            }
            let result = self.expire_index(&index.name, index.retention_days).await;
            self.in_flight.lock().unwrap().remove(&index.name);
            if let Err(e) = result {
                tracing::warn!("retention: delete for '{}' failed: {e}", index.name);
            }
        }
        Ok(())
    }

    /// Indexes appear in the catalog on first write; pick up any the
    /// ingestion path created implicitly.
    async fn adopt_unseen_indexes(&self) -> anyhow::Result<()> {
        let rows = self
            .storage
            .execute_query("SELECT DISTINCT index_name FROM events", &[])
            .await?;
        for row in rows {
            if let Some(serde_json::Value::String(name)) = row.get("index_name") {
                if valid_index_name(name) {
                    self.catalog.ensure_index(name)?;
                }
            }
        }
        Ok(())
    }

    /// Delete events past the index retention horizon. Idempotent.
    async fn expire_index(&self, name: &str, retention_days: u32) -> anyhow::Result<()> {
        let sql = match self.storage.dialect() {
            Dialect::Columnar => format!(
                "ALTER TABLE events DELETE WHERE index_name = '{name}' \
                 AND timestamp < now64(3) - INTERVAL {retention_days} DAY"
            ),
            Dialect::Relational => {
                let cutoff = crate::storage::format_sqlite_ts(
                    Utc::now() - chrono::Duration::days(retention_days as i64),
                );
                format!(
                    "DELETE FROM events WHERE index_name = '{name}' AND timestamp < '{cutoff}'"
                )
            }
        };
        tracing::debug!("retention: {sql}");
        self.storage.execute_ddl(&sql).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::Event;
    use crate::storage::SqliteBackend;

    #[tokio::test]
    async fn expired_events_are_deleted_per_index() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        catalog.create_index("shortlived", 1).unwrap();
        catalog.create_index("longlived", 90).unwrap();

        let now = Utc::now();
        let mut old = Event::default();
        old.timestamp = now - chrono::Duration::days(5);
        old.received_at = old.timestamp;
        let mut fresh = Event::default();
        fresh.timestamp = now - chrono::Duration::hours(1);
        fresh.received_at = fresh.timestamp;

        storage
            .insert_batch("shortlived", &[old.clone(), fresh.clone()])
            .await
            .unwrap();
        storage.insert_batch("longlived", &[old]).await.unwrap();

        let enforcer = RetentionEnforcer::new(storage.clone(), catalog);
        enforcer.run_once().await.unwrap();

        let rows = storage
            .execute_query(
                "SELECT index_name, COUNT(*) AS n FROM events GROUP BY index_name ORDER BY index_name",
                &[],
            )
            .await
            .unwrap();
        // shortlived keeps only the fresh event; longlived keeps its old one.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["index_name"], "longlived");
        assert_eq!(rows[0]["n"], 1);
        assert_eq!(rows[1]["index_name"], "shortlived");
        assert_eq!(rows[1]["n"], 1);
    }

    #[tokio::test]
    async fn unseen_indexes_are_adopted_with_defaults() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        storage
            .insert_batch("implicit", &[Event::default()])
            .await
            .unwrap();

        let enforcer = RetentionEnforcer::new(storage, catalog.clone());
        enforcer.run_once().await.unwrap();
        let idx = catalog.get_index("implicit").unwrap().unwrap();
        assert_eq!(idx.retention_days, 90);
    }
}

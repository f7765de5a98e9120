use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use timberline::analytics::anomaly::AnomalyDetector;
use timberline::analytics::baseline::BaselineEngine;
use timberline::catalog::Catalog;
use timberline::config::AppConfig;
use timberline::storage::{ClickhouseBackend, SqliteBackend, StorageBackend};

/// Standalone baseline + anomaly runner, for deployments that keep analytics
/// off the query node.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("timberline=debug")),
        )
        .init();

    let config_path =
        std::env::var("TIMBERLINE_CONFIG").unwrap_or_else(|_| "./timberline.toml".to_string());
    let mut config = AppConfig::load(&config_path)?;
    if let Ok(backend) = std::env::var("TIMBERLINE_BACKEND") {
        config.storage.backend = backend;
    }
    if let Ok(url) = std::env::var("CLICKHOUSE_URL") {
        config.storage.clickhouse.url = url;
    }
    if let Ok(password) = std::env::var("CLICKHOUSE_PASSWORD") {
        config.storage.clickhouse.password = password;
    }

    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "columnar" => {
            let ch = &config.storage.clickhouse;
            Arc::new(ClickhouseBackend::new(
                &ch.url,
                &ch.database,
                &ch.user,
                &ch.password,
            ))
        }
        "relational" => Arc::new(SqliteBackend::open(&config.storage.sqlite.path)?),
        other => anyhow::bail!("unknown storage backend '{other}'"),
    };

    let catalog_path = std::env::var("TIMBERLINE_CATALOG")
        .unwrap_or_else(|_| "./timberline_catalog.db".to_string());
    let catalog = Arc::new(Catalog::open(&catalog_path)?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tracing::info!("timberline-analytics starting");
    let baselines = BaselineEngine::new(
        storage.clone(),
        catalog.clone(),
        config.analytics.baseline.clone(),
    );
    baselines.spawn(shutdown_rx.clone());
    let detector = AnomalyDetector::new(
        storage,
        catalog,
        baselines,
        config.analytics.anomaly.clone(),
    );
    detector.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    Ok(())
}

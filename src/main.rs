use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use timberline::analytics::anomaly::AnomalyDetector;
use timberline::analytics::baseline::BaselineEngine;
use timberline::catalog::Catalog;
use timberline::config::AppConfig;
use timberline::engine::QueryEngine;
use timberline::extract::FieldExtractor;
use timberline::ingest::{run_tcp_receiver, run_udp_receiver, Ingestor};
use timberline::retention::RetentionEnforcer;
use timberline::storage::{ClickhouseBackend, SqliteBackend, StorageBackend};
use timberline::{handlers, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("timberline=debug,tower_http=debug")),
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
    if let Ok(db) = std::env::var("CLICKHOUSE_DATABASE") {
        config.storage.clickhouse.database = db;
    }
    if let Ok(user) = std::env::var("CLICKHOUSE_USER") {
        config.storage.clickhouse.user = user;
    }
    if let Ok(password) = std::env::var("CLICKHOUSE_PASSWORD") {
        config.storage.clickhouse.password = password;
    }

    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "columnar" => {
            let ch = &config.storage.clickhouse;
            let backend = ClickhouseBackend::new(&ch.url, &ch.database, &ch.user, &ch.password);
            backend.run_migrations().await?;
            Arc::new(backend)
        }
        "relational" => Arc::new(SqliteBackend::open(&config.storage.sqlite.path)?),
        other => anyhow::bail!("unknown storage backend '{other}'"),
    };
    tracing::info!("storage backend: {}", storage.dialect().as_str());

    let catalog_path =
        std::env::var("TIMBERLINE_CATALOG").unwrap_or_else(|_| "./timberline_catalog.db".to_string());
    let catalog = Arc::new(Catalog::open(&catalog_path)?);
    catalog.ensure_index(&config.ingest.default_index)?;
    tracing::info!("catalog opened at {catalog_path}");

    let extractor = Arc::new(FieldExtractor::new());
    extractor.load_patterns(&catalog.list_patterns()?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Ingestion: per-index flush tasks plus the two transports.
    let ingestor = Ingestor::new(storage.clone(), config.ingest.clone(), shutdown_rx.clone());
    ingestor.spawn_stats_task();
    {
        let cfg = config.ingest.clone();
        let ingestor = ingestor.clone();
        let extractor = extractor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_udp_receiver(cfg, ingestor, extractor, shutdown).await {
                tracing::error!("udp receiver failed: {e}");
            }
        });
    }
    {
        let cfg = config.ingest.clone();
        let ingestor = ingestor.clone();
        let extractor = extractor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_tcp_receiver(cfg, ingestor, extractor, shutdown).await {
                tracing::error!("tcp receiver failed: {e}");
            }
        });
    }

    // Background engines.
    let enforcer = RetentionEnforcer::new(storage.clone(), catalog.clone());
    enforcer.spawn(config.retention.clone(), shutdown_rx.clone());
    let baselines = BaselineEngine::new(
        storage.clone(),
        catalog.clone(),
        config.analytics.baseline.clone(),
    );
    baselines.spawn(shutdown_rx.clone());
    let detector = AnomalyDetector::new(
        storage.clone(),
        catalog.clone(),
        baselines.clone(),
        config.analytics.anomaly.clone(),
    );
    detector.spawn(shutdown_rx.clone());

    let engine = QueryEngine::new(storage.clone(), &config.query);
    let state = AppState {
        storage,
        catalog,
        engine,
        extractor,
    };

    let app = Router::new()
        // Query surface
        .route("/api/v1/query", post(handlers::query::execute_query))
        .route("/api/v1/query/validate", post(handlers::query::validate_query))
        // Index catalog
        .route(
            "/api/v1/indexes",
            get(handlers::indexes::list_indexes).post(handlers::indexes::create_index),
        )
        .route(
            "/api/v1/indexes/{name}",
            put(handlers::indexes::update_index).delete(handlers::indexes::delete_index),
        )
        // Dashboards
        .route(
            "/api/v1/dashboards",
            get(handlers::dashboards::list_dashboards).post(handlers::dashboards::create_dashboard),
        )
        .route(
            "/api/v1/dashboards/{id}",
            get(handlers::dashboards::get_dashboard)
                .put(handlers::dashboards::update_dashboard)
                .delete(handlers::dashboards::delete_dashboard),
        )
        .route(
            "/api/v1/dashboards/{id}/run",
            get(handlers::dashboards::run_dashboard),
        )
        .route(
            "/api/v1/dashboards/{id}/panels",
            post(handlers::dashboards::create_panel),
        )
        .route(
            "/api/v1/dashboards/{id}/panels/{pid}",
            put(handlers::dashboards::update_panel).delete(handlers::dashboards::delete_panel),
        )
        .route(
            "/api/v1/dashboards/{id}/variables",
            post(handlers::dashboards::create_variable),
        )
        .route(
            "/api/v1/dashboards/{id}/variables/{vid}",
            delete(handlers::dashboards::delete_variable),
        )
        // Saved searches and annotations
        .route(
            "/api/v1/searches",
            get(handlers::searches::list_saved_searches).post(handlers::searches::create_saved_search),
        )
        .route(
            "/api/v1/searches/{id}",
            delete(handlers::searches::delete_saved_search),
        )
        .route(
            "/api/v1/annotations",
            get(handlers::searches::list_annotations).post(handlers::searches::create_annotation),
        )
        .route(
            "/api/v1/annotations/{id}",
            delete(handlers::searches::delete_annotation),
        )
        // Fields: discovery, extraction patterns, preferences
        .route("/api/v1/fields/discover", get(handlers::fields::discover_fields))
        .route(
            "/api/v1/fields/patterns",
            get(handlers::fields::list_patterns).post(handlers::fields::create_pattern),
        )
        .route(
            "/api/v1/fields/patterns/{id}",
            delete(handlers::fields::delete_pattern),
        )
        .route("/api/v1/fields/patterns/test", post(handlers::fields::test_pattern))
        .route(
            "/api/v1/fields/preferences",
            get(handlers::fields::list_preferences).post(handlers::fields::upsert_preference),
        )
        // Anomalies
        .route("/api/v1/anomalies", get(handlers::anomalies::list_anomalies))
        .route(
            "/api/v1/anomalies/summary",
            get(handlers::anomalies::anomaly_summary),
        )
        .route(
            "/api/v1/anomalies/{id}/feedback",
            post(handlers::anomalies::set_feedback),
        )
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    tracing::info!("timberline listening on {}", config.server.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining ingestion");
            let _ = shutdown_tx.send(true);
            // Give flush tasks their grace period before the process exits.
            tokio::time::sleep(std::time::Duration::from_secs(
                config.ingest.shutdown_grace_secs + 1,
            ))
            .await;
        })
        .await?;

    Ok(())
}

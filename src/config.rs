use std::path::Path;

use serde::Deserialize;

/// Top-level config loaded from `timberline.toml`. Every section defaults so
/// an empty file (or none at all) boots a working single-node instance.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

impl AppConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!("no config file at {path}, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// "columnar" (ClickHouse) or "relational" (embedded SQLite).
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub clickhouse: ClickhouseConfig,
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            clickhouse: ClickhouseConfig::default(),
            sqlite: SqliteConfig::default(),
        }
    }
}

fn default_backend() -> String {
    "relational".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickhouseConfig {
    #[serde(default = "default_ch_url")]
    pub url: String,
    #[serde(default = "default_ch_database")]
    pub database: String,
    #[serde(default = "default_ch_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl Default for ClickhouseConfig {
    fn default() -> Self {
        Self {
            url: default_ch_url(),
            database: default_ch_database(),
            user: default_ch_user(),
            password: String::new(),
        }
    }
}

fn default_ch_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_ch_database() -> String {
    "timberline".to_string()
}

fn default_ch_user() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> String {
    "./timberline_events.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_udp_listen")]
    pub udp_listen: String,
    #[serde(default = "default_tcp_listen")]
    pub tcp_listen: String,
    #[serde(default = "default_index_name")]
    pub default_index: String,
    /// (app/hostname prefix, index) pairs, first match wins.
    #[serde(default)]
    pub routes: Vec<(String, String)>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_delay_ms")]
    pub max_batch_delay_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            udp_listen: default_udp_listen(),
            tcp_listen: default_tcp_listen(),
            default_index: default_index_name(),
            routes: Vec::new(),
            max_batch_size: default_max_batch_size(),
            max_batch_delay_ms: default_max_batch_delay_ms(),
            channel_capacity: default_channel_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_udp_listen() -> String {
    "0.0.0.0:5514".to_string()
}

fn default_tcp_listen() -> String {
    "0.0.0.0:5514".to_string()
}

fn default_index_name() -> String {
    "default".to_string()
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_delay_ms() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// 0 means 2x the CPU core count.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_max_rows_pre_agg")]
    pub max_rows_pre_agg: u64,
    #[serde(default = "default_max_rows_post_agg")]
    pub max_rows_post_agg: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            workers: 0,
            max_rows_pre_agg: default_max_rows_pre_agg(),
            max_rows_post_agg: default_max_rows_post_agg(),
        }
    }
}

impl QueryConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4)
        }
    }
}

fn default_deadline_secs() -> u64 {
    30
}

fn default_max_rows_pre_agg() -> u64 {
    50_000
}

fn default_max_rows_post_agg() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_retention_interval_secs(),
        }
    }
}

fn default_retention_interval_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnalyticsConfig {
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BaselineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_baseline_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_baseline_interval_secs(),
            window_days: default_window_days(),
            min_samples: default_min_samples(),
        }
    }
}

fn default_baseline_interval_secs() -> u64 {
    3600
}

fn default_window_days() -> u32 {
    14
}

fn default_min_samples() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_anomaly_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_spike_threshold")]
    pub spike_threshold: f64,
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: f64,
    /// Off-hours window, inclusive start hour, exclusive end hour (UTC).
    #[serde(default = "default_off_hours_start")]
    pub off_hours_start: u32,
    #[serde(default = "default_off_hours_end")]
    pub off_hours_end: u32,
    #[serde(default = "default_related_logs_limit")]
    pub related_logs_limit: usize,
    #[serde(default = "default_new_behavior_hours")]
    pub new_behavior_hours: i64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_anomaly_interval_secs(),
            spike_threshold: default_spike_threshold(),
            drop_threshold: default_drop_threshold(),
            off_hours_start: default_off_hours_start(),
            off_hours_end: default_off_hours_end(),
            related_logs_limit: default_related_logs_limit(),
            new_behavior_hours: default_new_behavior_hours(),
        }
    }
}

fn default_anomaly_interval_secs() -> u64 {
    3600
}

fn default_spike_threshold() -> f64 {
    3.0
}

fn default_drop_threshold() -> f64 {
    -3.0
}

fn default_off_hours_start() -> u32 {
    22
}

fn default_off_hours_end() -> u32 {
    6
}

fn default_related_logs_limit() -> usize {
    10
}

fn default_new_behavior_hours() -> i64 {
    24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.ingest.max_batch_size, 1000);
        assert_eq!(config.ingest.max_batch_delay_ms, 100);
        assert_eq!(config.query.deadline_secs, 30);
        assert_eq!(config.analytics.baseline.window_days, 14);
        assert_eq!(config.analytics.anomaly.spike_threshold, 3.0);
    }

    #[test]
    fn partial_section_overrides() {
        let config: AppConfig = toml::from_str(
            "[ingest]\nmax_batch_size = 50\n\n[storage]\nbackend = \"columnar\"\n",
        )
        .unwrap();
        assert_eq!(config.ingest.max_batch_size, 50);
        assert_eq!(config.ingest.max_batch_delay_ms, 100);
        assert_eq!(config.storage.backend, "columnar");
    }
}

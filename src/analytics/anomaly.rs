use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::watch;

use crate::analytics::baseline::{deviation_score, BaselineEngine};
use crate::analytics::{entity_expr, hourly_counts_sql, first_seen_sql, METRIC_ERROR_COUNT, METRIC_EVENT_COUNT};
use crate::catalog::Catalog;
use crate::config::AnomalyConfig;
use crate::dsl::eval::{as_number, as_string};
use crate::extract::ipclass::classify_ip;
use crate::models::anomaly::{AnomalyRecord, ENTITY_TYPES};
use crate::storage::{Dialect, SqlParam, StorageBackend};

const RELATED_LOG_SNIPPET_CHARS: usize = 500;

/// Fixed multiplier tables feeding the risk score.
fn type_multiplier(anomaly_type: &str) -> f64 {
    match anomaly_type {
        "spike" => 1.0,
        "drop" => 1.0,
        "time_anomaly" => 1.2,
        "new_behavior" => 0.6,
        _ => 1.0,
    }
}

fn entity_multiplier(entity_type: &str) -> f64 {
    match entity_type {
        "user" => 1.2,
        "host" => 1.0,
        "ip" => 1.1,
        "app" => 0.9,
        _ => 1.0,
    }
}

/// `min(60, |deviation| * 15) * typeMult * entityMult`, clamped to 0..=100.
pub fn calculate_risk_score(deviation: f64, anomaly_type: &str, entity_type: &str) -> u8 {
    let base = f64::min(60.0, deviation.abs() * 15.0);
    let score = base * type_multiplier(anomaly_type) * entity_multiplier(entity_type);
    score.round().clamp(0.0, 100.0) as u8
}

pub fn determine_severity(risk_score: u8) -> &'static str {
    match risk_score {
        0..=39 => "low",
        40..=59 => "medium",
        60..=79 => "high",
        _ => "critical",
    }
}

/// Hourly detector over the last-hour observations of every entity.
pub struct AnomalyDetector {
    storage: Arc<dyn StorageBackend>,
    catalog: Arc<Catalog>,
    baselines: Arc<BaselineEngine>,
    config: AnomalyConfig,
}

#[derive(Debug)]
struct Detection {
    anomaly_type: &'static str,
    metric_name: String,
    observed: f64,
    expected: Option<f64>,
    deviation: f64,
}

impl AnomalyDetector {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        catalog: Arc<Catalog>,
        baselines: Arc<BaselineEngine>,
        config: AnomalyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            catalog,
            baselines,
            config,
        })
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            tracing::info!("anomaly detector: disabled by config");
            return;
        }
        let detector = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "anomaly detector: started (interval={}s)",
                detector.config.interval_secs
            );
            let mut interval =
                tokio::time::interval(Duration::from_secs(detector.config.interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match detector.run_once(Utc::now()).await {
                            Ok(found) if found > 0 => {
                                tracing::info!("anomaly detector: tick stored {found} anomalies");
                            }
                            Ok(_) => tracing::debug!("anomaly detector: tick, nothing anomalous"),
                            Err(e) => tracing::error!("anomaly detector error: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("anomaly detector: shutting down");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// One detection pass over the hour leading up to `now`. Returns how many
    /// anomalies were stored.
    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut stored = 0u64;
        for entity_type in ENTITY_TYPES {
            stored += self.detect_entity_type(entity_type, now).await?;
        }
        Ok(stored)
    }

    async fn detect_entity_type(
        &self,
        entity_type: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let hour_ago = now - chrono::Duration::hours(1);
        let sql = hourly_counts_sql(self.storage.dialect(), entity_type);
        let rows = self
            .storage
            .execute_query(&sql, &[SqlParam::DateTime(hour_ago)])
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        // Aggregate partial hour buckets into one observation per entity.
        let mut observed: HashMap<String, (f64, f64)> = HashMap::new();
        for row in &rows {
            let entity = row
                .get("entity_id")
                .map(as_string)
                .unwrap_or_default();
            if entity.is_empty() {
                continue;
            }
            let events = row.get("event_count").and_then(as_number).unwrap_or(0.0);
            let errors = row.get("error_count").and_then(as_number).unwrap_or(0.0);
            let slot = observed.entry(entity).or_insert((0.0, 0.0));
            slot.0 += events;
            slot.1 += errors;
        }

        let first_seen = self.first_seen_map(entity_type, now).await?;

        let mut stored = 0u64;
        for (entity_id, (event_count, error_count)) in observed {
            let detections =
                self.evaluate_entity(entity_type, &entity_id, event_count, error_count, &first_seen, now)?;
            for d in detections {
                self.store_detection(entity_type, &entity_id, d, now).await?;
                stored += 1;
            }
        }
        Ok(stored)
    }

    fn evaluate_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        event_count: f64,
        error_count: f64,
        first_seen: &HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Detection>> {
        let mut out = Vec::new();

        let is_new = first_seen
            .get(entity_id)
            .is_some_and(|t| now - *t < chrono::Duration::hours(self.config.new_behavior_hours));
        if is_new && event_count >= 1.0 {
            out.push(Detection {
                anomaly_type: "new_behavior",
                metric_name: METRIC_EVENT_COUNT.to_string(),
                observed: event_count,
                expected: None,
                deviation: 4.0,
            });
        }

        for (metric, value) in [
            (METRIC_EVENT_COUNT, event_count),
            (METRIC_ERROR_COUNT, error_count),
        ] {
            let expected = self
                .baselines
                .expected_value(entity_type, entity_id, metric, now)?;
            if let Some(exp) = expected.filter(|e| e.trusted) {
                let dev = deviation_score(value, exp.mean, exp.stddev);
                if dev >= self.config.spike_threshold {
                    out.push(Detection {
                        anomaly_type: "spike",
                        metric_name: metric.to_string(),
                        observed: value,
                        expected: Some(exp.mean),
                        deviation: dev,
                    });
                } else if dev <= self.config.drop_threshold {
                    out.push(Detection {
                        anomaly_type: "drop",
                        metric_name: metric.to_string(),
                        observed: value,
                        expected: Some(exp.mean),
                        deviation: dev,
                    });
                }
            }
        }

        // Activity in the off-hours window with no trusted baseline for this
        // hour-of-week cell. Novel entities already fired new_behavior.
        if !is_new
            && self.in_off_hours(now.hour())
            && event_count >= 1.0
            && !self.baselines.has_trusted_cell(
                entity_type,
                entity_id,
                METRIC_EVENT_COUNT,
                now,
            )?
        {
            let fallback = self
                .baselines
                .expected_value(entity_type, entity_id, METRIC_EVENT_COUNT, now)?;
            let deviation = fallback
                .map(|e| deviation_score(event_count, e.mean, e.stddev).abs())
                .unwrap_or(3.0)
                .max(3.0);
            out.push(Detection {
                anomaly_type: "time_anomaly",
                metric_name: METRIC_EVENT_COUNT.to_string(),
                observed: event_count,
                expected: fallback.map(|e| e.mean),
                deviation,
            });
        }

        Ok(out)
    }

    fn in_off_hours(&self, hour: u32) -> bool {
        let start = self.config.off_hours_start;
        let end = self.config.off_hours_end;
        if start <= end {
            (start..end).contains(&hour)
        } else {
            // Window wraps midnight, e.g. 22..6.
            hour >= start || hour < end
        }
    }

    async fn first_seen_map(
        &self,
        entity_type: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<HashMap<String, DateTime<Utc>>> {
        let lookback = now - chrono::Duration::days(30);
        let sql = first_seen_sql(self.storage.dialect(), entity_type);
        let rows = self
            .storage
            .execute_query(&sql, &[SqlParam::DateTime(lookback)])
            .await?;
        let mut out = HashMap::new();
        for row in rows {
            let entity = row.get("entity_id").map(as_string).unwrap_or_default();
            let Some(ts) = row
                .get("first_seen")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            else {
                continue;
            };
            out.insert(entity, ts.with_timezone(&Utc));
        }
        Ok(out)
    }

    async fn store_detection(
        &self,
        entity_type: &str,
        entity_id: &str,
        d: Detection,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let risk_score = calculate_risk_score(d.deviation, d.anomaly_type, entity_type);
        let severity = determine_severity(risk_score);
        let related_logs = self
            .related_logs(entity_type, entity_id, now)
            .await
            .unwrap_or_default();

        let mut context = serde_json::json!({
            "window_start": (now - chrono::Duration::hours(1)).to_rfc3339(),
            "window_end": now.to_rfc3339(),
        });
        if entity_type == "ip" {
            if let Ok(ip) = entity_id.parse::<std::net::IpAddr>() {
                context["ip"] = serde_json::to_value(classify_ip(ip))?;
            }
        }

        let record = AnomalyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            anomaly_type: d.anomaly_type.to_string(),
            metric_name: d.metric_name,
            observed: d.observed,
            expected: d.expected,
            deviation_score: d.deviation,
            risk_score,
            severity: severity.to_string(),
            related_logs: serde_json::to_string(&related_logs)?,
            context: context.to_string(),
            is_false_positive: false,
            feedback_at: None,
            created_at: String::new(),
        };
        self.catalog.insert_anomaly(&record)?;
        tracing::info!(
            "anomaly: {} {}={} {} observed={:.1} expected={:?} dev={:.2} risk={risk_score} ({severity})",
            record.anomaly_type,
            entity_type,
            entity_id,
            record.metric_name,
            d.observed,
            d.expected,
            d.deviation,
        );
        Ok(())
    }

    /// Up to `related_logs_limit` message snippets from the hour leading up
    /// to the anomaly, each truncated to 500 characters.
    async fn related_logs(
        &self,
        entity_type: &str,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<String>> {
        let entity = entity_expr(self.storage.dialect(), entity_type);
        let limit = self.config.related_logs_limit;
        let sql = match self.storage.dialect() {
            Dialect::Columnar => format!(
                "SELECT message FROM events WHERE {entity} = {{p0:String}} \
                 AND timestamp >= {{p1:DateTime64(3)}} AND timestamp <= {{p2:DateTime64(3)}} \
                 ORDER BY timestamp DESC LIMIT {limit}"
            ),
            Dialect::Relational => format!(
                "SELECT message FROM events WHERE {entity} = ?1 \
                 AND timestamp >= ?2 AND timestamp <= ?3 \
                 ORDER BY timestamp DESC LIMIT {limit}"
            ),
        };
        let rows = self
            .storage
            .execute_query(
                &sql,
                &[
                    SqlParam::String(entity_id.to_string()),
                    SqlParam::DateTime(now - chrono::Duration::hours(1)),
                    SqlParam::DateTime(now),
                ],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("message").map(as_string))
            .map(|m| m.chars().take(RELATED_LOG_SNIPPET_CHARS).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_score_fixture() {
        // min(60, 3 * 15) = 45, spike and host multipliers are 1.0.
        assert_eq!(calculate_risk_score(3.0, "spike", "host"), 45);
        assert_eq!(determine_severity(45), "medium");
    }

    #[test]
    fn risk_score_multipliers() {
        // Base caps at 60; time_anomaly on a user entity: 60 * 1.2 * 1.2.
        assert_eq!(calculate_risk_score(10.0, "time_anomaly", "user"), 86);
        // new_behavior dampens: 60 * 0.6 * 0.9.
        assert_eq!(calculate_risk_score(10.0, "new_behavior", "app"), 32);
        // Negative deviations score on magnitude.
        assert_eq!(
            calculate_risk_score(-3.0, "drop", "host"),
            calculate_risk_score(3.0, "spike", "host")
        );
    }

    #[test]
    fn risk_score_stays_in_bounds() {
        for dev in [0.0, 0.5, 3.0, 50.0, -80.0] {
            for ty in ["spike", "drop", "time_anomaly", "new_behavior"] {
                for entity in ["user", "host", "ip", "app"] {
                    let score = calculate_risk_score(dev, ty, entity);
                    assert!(score <= 100);
                }
            }
        }
    }

    #[test]
    fn severity_buckets_exact_at_boundaries() {
        assert_eq!(determine_severity(39), "low");
        assert_eq!(determine_severity(40), "medium");
        assert_eq!(determine_severity(59), "medium");
        assert_eq!(determine_severity(60), "high");
        assert_eq!(determine_severity(79), "high");
        assert_eq!(determine_severity(80), "critical");
        assert_eq!(determine_severity(100), "critical");
    }

    #[test]
    fn off_hours_window_wraps_midnight() {
        let detector_cfg = AnomalyConfig::default();
        // Default window is 22:00..06:00.
        let wraps = |hour: u32| {
            let start = detector_cfg.off_hours_start;
            let end = detector_cfg.off_hours_end;
            if start <= end {
                (start..end).contains(&hour)
            } else {
                hour >= start || hour < end
            }
        };
        assert!(wraps(23));
        assert!(wraps(2));
        assert!(!wraps(12));
        assert!(!wraps(6));
        assert!(wraps(22));
    }

    mod end_to_end {
        use super::*;
        use crate::analytics::METRIC_EVENT_COUNT;
        use crate::config::BaselineConfig;
        use crate::models::anomaly::Baseline;
        use crate::models::event::Event;
        use crate::storage::SqliteBackend;
        use chrono::DurationRound;

        fn hour_cells_for(now: DateTime<Utc>, mean: f64, samples: u64) -> Vec<Baseline> {
            // A trusted baseline for every hour-of-week cell.
            let mut cells = Vec::new();
            for dow in 0..7 {
                for hour in 0..24 {
                    cells.push(Baseline {
                        entity_type: "host".to_string(),
                        entity_id: "web-01".to_string(),
                        metric_name: METRIC_EVENT_COUNT.to_string(),
                        hour_of_day: hour,
                        day_of_week: dow,
                        mean,
                        stddev: 2.0,
                        sample_count: samples,
                        updated_at: now.to_rfc3339(),
                    });
                }
            }
            cells
        }

        #[tokio::test]
        async fn spike_detection_end_to_end() {
            let storage: Arc<dyn StorageBackend> =
                Arc::new(SqliteBackend::open_in_memory().unwrap());
            let catalog = Arc::new(Catalog::open_in_memory().unwrap());
            let now = Utc::now().duration_trunc(chrono::Duration::hours(1)).unwrap()
                + chrono::Duration::minutes(30);

            catalog
                .replace_baselines("host", &hour_cells_for(now, 5.0, 10))
                .unwrap();

            // 40 events in the last hour against a mean of 5: a clear spike.
            let mut events = Vec::new();
            for i in 0..40i64 {
                let mut e = Event::default();
                e.hostname = "web-01".to_string();
                e.timestamp = now - chrono::Duration::minutes(i % 55);
                e.received_at = e.timestamp;
                events.push(e);
            }
            // Make the entity old enough to not be novel.
            let mut seed = Event::default();
            seed.hostname = "web-01".to_string();
            seed.timestamp = now - chrono::Duration::days(10);
            seed.received_at = seed.timestamp;
            events.push(seed);
            storage.insert_batch("default", &events).await.unwrap();

            let baselines = BaselineEngine::new(
                storage.clone(),
                catalog.clone(),
                BaselineConfig::default(),
            );
            let detector = AnomalyDetector::new(
                storage,
                catalog.clone(),
                baselines,
                AnomalyConfig {
                    // Pin the off-hours window away from "now" so the spike
                    // is the only candidate.
                    off_hours_start: now.hour(),
                    off_hours_end: now.hour(),
                    ..AnomalyConfig::default()
                },
            );
            let stored = detector.run_once(now).await.unwrap();
            assert!(stored >= 1, "expected at least the host spike");

            let anomalies = catalog.list_anomalies(Some("host"), None, true, 10).unwrap();
            let spike = anomalies
                .iter()
                .find(|a| a.anomaly_type == "spike" && a.entity_id == "web-01")
                .unwrap();
            assert_eq!(spike.metric_name, METRIC_EVENT_COUNT);
            assert!(spike.observed >= 40.0);
            assert_eq!(spike.expected, Some(5.0));
            assert!(spike.deviation_score > 3.0);
            assert!(spike.risk_score <= 100);
            assert!(!spike.related_logs.is_empty());
        }

        #[tokio::test]
        async fn new_entity_fires_new_behavior() {
            let storage: Arc<dyn StorageBackend> =
                Arc::new(SqliteBackend::open_in_memory().unwrap());
            let catalog = Arc::new(Catalog::open_in_memory().unwrap());
            let now = Utc::now();

            let mut e = Event::default();
            e.hostname = "brand-new-host".to_string();
            e.timestamp = now - chrono::Duration::minutes(10);
            e.received_at = e.timestamp;
            storage.insert_batch("default", &[e]).await.unwrap();

            let baselines = BaselineEngine::new(
                storage.clone(),
                catalog.clone(),
                BaselineConfig::default(),
            );
            let detector = AnomalyDetector::new(
                storage,
                catalog.clone(),
                baselines,
                AnomalyConfig::default(),
            );
            detector.run_once(now).await.unwrap();

            let anomalies = catalog.list_anomalies(Some("host"), None, true, 10).unwrap();
            let novel = anomalies
                .iter()
                .find(|a| a.anomaly_type == "new_behavior")
                .unwrap();
            assert_eq!(novel.entity_id, "brand-new-host");
            // Fixed novelty deviation of 4.0: min(60, 60) * 0.6 * 1.0 = 36.
            assert_eq!(novel.risk_score, 36);
            assert_eq!(novel.severity, "low");
        }
    }
}

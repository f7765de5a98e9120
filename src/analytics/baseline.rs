use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::watch;

use crate::analytics::{hourly_counts_sql, METRIC_ERROR_COUNT, METRIC_EVENT_COUNT};
use crate::catalog::Catalog;
use crate::config::BaselineConfig;
use crate::dsl::eval::as_number;
use crate::models::anomaly::{Baseline, ENTITY_TYPES};
use crate::storage::{SqlParam, StorageBackend};

/// Streaming baseliner: per (entity, metric, hour-of-day, day-of-week) cell,
/// rebuilt in full from the historical window each scheduled pass.
pub struct BaselineEngine {
    storage: Arc<dyn StorageBackend>,
    catalog: Arc<Catalog>,
    config: BaselineConfig,
}

/// One hourly observation feeding the baseline.
#[derive(Debug, Clone)]
pub struct HourlySample {
    pub entity_id: String,
    pub bucket: DateTime<Utc>,
    pub value: f64,
}

impl BaselineEngine {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        catalog: Arc<Catalog>,
        config: BaselineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            catalog,
            config,
        })
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            tracing::info!("baseline engine: disabled by config");
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "baseline engine: started (interval={}s, window={}d)",
                engine.config.interval_secs,
                engine.config.window_days
            );
            let mut interval =
                tokio::time::interval(Duration::from_secs(engine.config.interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.rebuild_all().await {
                            tracing::error!("baseline rebuild error: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("baseline engine: shutting down");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Full rebuild across every entity type and metric.
    pub async fn rebuild_all(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for entity_type in ENTITY_TYPES {
            let cells = self.build_entity_cells(entity_type, now).await?;
            let count = cells.len();
            self.catalog.replace_baselines(entity_type, &cells)?;
            tracing::info!("baseline rebuild: {entity_type} -> {count} cells");
        }
        Ok(())
    }

    async fn build_entity_cells(
        &self,
        entity_type: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Baseline>> {
        let window_start = now - chrono::Duration::days(self.config.window_days as i64);
        let sql = hourly_counts_sql(self.storage.dialect(), entity_type);
        let rows = self
            .storage
            .execute_query(&sql, &[SqlParam::DateTime(window_start)])
            .await?;

        let mut event_samples = Vec::new();
        let mut error_samples = Vec::new();
        for row in &rows {
            let Some(serde_json::Value::String(entity_id)) = row.get("entity_id") else {
                continue;
            };
            let Some(bucket) = row
                .get("bucket")
                .and_then(|v| v.as_str())
                .and_then(parse_bucket)
            else {
                continue;
            };
            let events = row.get("event_count").and_then(as_number).unwrap_or(0.0);
            let errors = row.get("error_count").and_then(as_number).unwrap_or(0.0);
            event_samples.push(HourlySample {
                entity_id: entity_id.clone(),
                bucket,
                value: events,
            });
            error_samples.push(HourlySample {
                entity_id: entity_id.clone(),
                bucket,
                value: errors,
            });
        }

        let updated_at = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let mut cells = build_cells(entity_type, METRIC_EVENT_COUNT, &event_samples, &updated_at);
        cells.extend(build_cells(
            entity_type,
            METRIC_ERROR_COUNT,
            &error_samples,
            &updated_at,
        ));
        Ok(cells)
    }

    /// Expected (mean, stddev, trusted) for an observation at `t`: the exact
    /// hour-of-week cell, falling back to the all-hours aggregate, falling
    /// back to nothing.
    pub fn expected_value(
        &self,
        entity_type: &str,
        entity_id: &str,
        metric_name: &str,
        t: DateTime<Utc>,
    ) -> anyhow::Result<Option<Expected>> {
        let hour = t.hour();
        let dow = t.weekday().num_days_from_monday();
        if let Some(cell) =
            self.catalog
                .get_baseline(entity_type, entity_id, metric_name, hour, dow)?
        {
            return Ok(Some(Expected {
                mean: cell.mean,
                stddev: cell.stddev,
                sample_count: cell.sample_count,
                trusted: cell.sample_count >= self.config.min_samples,
                from_exact_cell: true,
            }));
        }
        let all = self
            .catalog
            .baselines_for_entity(entity_type, entity_id, metric_name)?;
        Ok(aggregate_cells(&all).map(|(mean, stddev, samples)| Expected {
            mean,
            stddev,
            sample_count: samples,
            trusted: samples >= self.config.min_samples,
            from_exact_cell: false,
        }))
    }

    /// Whether any trusted cell exists for this entity at this hour/day.
    pub fn has_trusted_cell(
        &self,
        entity_type: &str,
        entity_id: &str,
        metric_name: &str,
        t: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let hour = t.hour();
        let dow = t.weekday().num_days_from_monday();
        Ok(self
            .catalog
            .get_baseline(entity_type, entity_id, metric_name, hour, dow)?
            .is_some_and(|cell| cell.sample_count >= self.config.min_samples))
    }

    pub fn min_samples(&self) -> u64 {
        self.config.min_samples
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Expected {
    pub mean: f64,
    pub stddev: f64,
    pub sample_count: u64,
    pub trusted: bool,
    pub from_exact_cell: bool,
}

/// Z-score with a stddev floor of max(1, 0.1 * mean) to stabilize
/// low-variance series.
pub fn deviation_score(observed: f64, mean: f64, stddev: f64) -> f64 {
    let floor = f64::max(1.0, 0.1 * mean);
    (observed - mean) / f64::max(stddev, floor)
}

fn parse_bucket(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|t| chrono::TimeZone::from_utc_datetime(&Utc, &t))
        })
}

/// Fold hourly samples into (hour, day-of-week) cells. Population stddev,
/// zero when fewer than two samples.
pub fn build_cells(
    entity_type: &str,
    metric_name: &str,
    samples: &[HourlySample],
    updated_at: &str,
) -> Vec<Baseline> {
    let mut cells: HashMap<(String, u32, u32), Vec<f64>> = HashMap::new();
    for s in samples {
        let hour = s.bucket.hour();
        let dow = s.bucket.weekday().num_days_from_monday();
        cells
            .entry((s.entity_id.clone(), hour, dow))
            .or_default()
            .push(s.value);
    }

    let mut out: Vec<Baseline> = cells
        .into_iter()
        .map(|((entity_id, hour, dow), values)| {
            let (mean, stddev) = mean_stddev(&values);
            Baseline {
                entity_type: entity_type.to_string(),
                entity_id,
                metric_name: metric_name.to_string(),
                hour_of_day: hour,
                day_of_week: dow,
                mean,
                stddev,
                sample_count: values.len() as u64,
                updated_at: updated_at.to_string(),
            }
        })
        .collect();
    out.sort_by(|a, b| {
        (&a.entity_id, a.day_of_week, a.hour_of_day)
            .cmp(&(&b.entity_id, b.day_of_week, b.hour_of_day))
    });
    out
}

pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Sample-count-weighted aggregate across all hour-of-week cells.
pub fn aggregate_cells(cells: &[Baseline]) -> Option<(f64, f64, u64)> {
    let total: u64 = cells.iter().map(|c| c.sample_count).sum();
    if total == 0 {
        return None;
    }
    let weight = |c: &Baseline| c.sample_count as f64 / total as f64;
    let mean = cells.iter().map(|c| c.mean * weight(c)).sum();
    let stddev = cells.iter().map(|c| c.stddev * weight(c)).sum();
    Some((mean, stddev, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn sample(entity: &str, ts: &str, value: f64) -> HourlySample {
        HourlySample {
            entity_id: entity.to_string(),
            bucket: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
            value,
        }
    }

    #[test]
    fn mean_and_population_stddev() {
        let (mean, stddev) = mean_stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_approx(mean, 5.0);
        assert_approx(stddev, 2.0);
    }

    #[test]
    fn single_sample_has_zero_stddev() {
        let (mean, stddev) = mean_stddev(&[42.0]);
        assert_approx(mean, 42.0);
        assert_approx(stddev, 0.0);
    }

    #[test]
    fn cells_bucket_by_hour_and_weekday() {
        // Two Tuesdays at 13:00 and one Wednesday at 13:00.
        let samples = vec![
            sample("web-01", "2023-10-10T13:00:00Z", 10.0),
            sample("web-01", "2023-10-17T13:00:00Z", 20.0),
            sample("web-01", "2023-10-11T13:00:00Z", 7.0),
        ];
        let cells = build_cells("host", METRIC_EVENT_COUNT, &samples, "2023-10-18T00:00:00Z");
        assert_eq!(cells.len(), 2);
        let tuesday = cells
            .iter()
            .find(|c| c.day_of_week == 1 && c.hour_of_day == 13)
            .unwrap();
        assert_approx(tuesday.mean, 15.0);
        assert_approx(tuesday.stddev, 5.0);
        assert_eq!(tuesday.sample_count, 2);
        let wednesday = cells
            .iter()
            .find(|c| c.day_of_week == 2 && c.hour_of_day == 13)
            .unwrap();
        assert_eq!(wednesday.sample_count, 1);
        assert_approx(wednesday.stddev, 0.0);
    }

    #[test]
    fn deviation_uses_stddev_floor() {
        // stddev 0.1 with mean 2: floor is max(1, 0.2) = 1.
        assert_approx(deviation_score(5.0, 2.0, 0.1), 3.0);
        // Large mean raises the floor to 0.1 * mean.
        assert_approx(deviation_score(1300.0, 1000.0, 20.0), 3.0);
        // A healthy stddev is used as-is.
        assert_approx(deviation_score(30.0, 10.0, 10.0), 2.0);
    }

    #[test]
    fn aggregate_weights_by_sample_count() {
        let mk = |mean: f64, samples: u64| Baseline {
            entity_type: "host".to_string(),
            entity_id: "h".to_string(),
            metric_name: METRIC_EVENT_COUNT.to_string(),
            hour_of_day: 0,
            day_of_week: 0,
            mean,
            stddev: 1.0,
            sample_count: samples,
            updated_at: String::new(),
        };
        let (mean, _, total) = aggregate_cells(&[mk(10.0, 3), mk(20.0, 1)]).unwrap();
        assert_approx(mean, 12.5);
        assert_eq!(total, 4);
        assert!(aggregate_cells(&[]).is_none());
    }

    #[tokio::test]
    async fn rebuild_from_relational_backend() {
        use chrono::DurationRound;

        use crate::models::event::Event;
        use crate::storage::SqliteBackend;

        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());

        // Six events in one hour bucket inside the rebuild window, two of
        // them at error severity.
        let base = (Utc::now() - chrono::Duration::hours(3))
            .duration_trunc(chrono::Duration::hours(1))
            .unwrap();
        let mut events = Vec::new();
        for i in 0..6i64 {
            let mut e = Event::default();
            e.hostname = "web-01".to_string();
            e.severity = if i < 2 { 3 } else { 6 };
            e.timestamp = base + chrono::Duration::minutes(i * 5);
            e.received_at = e.timestamp;
            events.push(e);
        }
        storage.insert_batch("default", &events).await.unwrap();

        let engine = BaselineEngine::new(storage, catalog.clone(), BaselineConfig::default());
        engine.rebuild_all().await.unwrap();

        let event_cells = catalog
            .baselines_for_entity("host", "web-01", METRIC_EVENT_COUNT)
            .unwrap();
        assert_eq!(event_cells.len(), 1);
        assert_eq!(event_cells[0].hour_of_day, base.hour());
        assert_approx(event_cells[0].mean, 6.0);
        assert_eq!(event_cells[0].sample_count, 1);

        let error_cells = catalog
            .baselines_for_entity("host", "web-01", METRIC_ERROR_COUNT)
            .unwrap();
        assert_approx(error_cells[0].mean, 2.0);
    }
}

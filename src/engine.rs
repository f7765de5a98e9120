use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::QueryConfig;
use crate::dsl::postprocess::{PostOp, PostProcessor};
use crate::dsl::timerange;
use crate::dsl::{parse, validate, Planner, Validation};
use crate::error::QueryError;
use crate::models::query::{QueryRequest, QueryResponse};
use crate::storage::StorageBackend;

/// Parse -> validate -> plan -> execute -> post-process, under a bounded
/// worker pool and a per-query deadline.
pub struct QueryEngine {
    storage: Arc<dyn StorageBackend>,
    workers: Arc<Semaphore>,
    deadline: Duration,
    pre_agg_cap: u64,
    post_agg_cap: u64,
}

impl QueryEngine {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &QueryConfig) -> Arc<Self> {
        Arc::new(Self {
            storage,
            workers: Arc::new(Semaphore::new(config.effective_workers())),
            deadline: Duration::from_secs(config.deadline_secs),
            pre_agg_cap: config.max_rows_pre_agg,
            post_agg_cap: config.max_rows_post_agg,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.storage.dialect().as_str()
    }

    /// Validate without executing.
    pub fn validate_query(&self, query: &str) -> Result<Validation, QueryError> {
        let pipeline = parse(query)?;
        Ok(validate(&pipeline))
    }

    pub async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();

        let pipeline = parse(&request.query)?;
        let validation = validate(&pipeline);
        if let Some(first) = validation.first_error() {
            return Err(QueryError::validation(
                first.message.clone(),
                first.stage_index,
            ));
        }

        let range = timerange::resolve(
            request.earliest.as_deref(),
            request.latest.as_deref(),
            chrono::Utc::now(),
        )?;

        let mut planner = Planner::new(self.storage.dialect());
        planner.pre_agg_cap = self.pre_agg_cap;
        planner.post_agg_cap = self.post_agg_cap;
        let plan = planner.plan(&pipeline, range, request.source_type.as_deref())?;

        // Queries run to completion inside one worker slot; the deadline
        // covers storage plus post-processing.
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| QueryError::Plan("worker pool closed".to_string()))?;

        let rows = tokio::time::timeout(
            self.deadline,
            self.storage.execute_query(&plan.sql, &plan.params),
        )
        .await
        .map_err(|_| QueryError::DeadlineExceeded(self.deadline))??;

        let aggregated = plan
            .post_ops
            .iter()
            .any(|op| matches!(op, PostOp::Aggregate { .. }))
            || plan.sql.contains("GROUP BY");

        let post = PostProcessor::new(self.pre_agg_cap as usize);
        let mut rows = post.apply(&plan.post_ops, rows)?;
        if aggregated && rows.len() > self.post_agg_cap as usize {
            rows.truncate(self.post_agg_cap as usize);
        }

        if request.extract_fields {
            for row in &mut rows {
                let flattened: Vec<(String, Json)> = match row.get("structured_data") {
                    Some(Json::Object(map)) => {
                        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                    }
                    _ => Vec::new(),
                };
                for (key, value) in flattened {
                    row.entry(key).or_insert(value);
                }
            }
        }

        let mut warnings: Vec<String> =
            validation.warnings.iter().map(|w| w.message.clone()).collect();
        warnings.extend(plan.warnings.iter().cloned());

        Ok(QueryResponse {
            sql: plan.sql,
            count: rows.len(),
            results: rows.into_iter().map(Json::Object).collect(),
            execution_time_ms: started.elapsed().as_millis() as u64,
            backend: self.backend_name().to_string(),
            warnings,
        })
    }
}

/// Replace `$name$` placeholders in a panel query with variable values.
pub fn substitute_variables(query: &str, variables: &[(String, String)]) -> String {
    let mut out = query.to_string();
    for (name, value) in variables {
        out = out.replace(&format!("${name}$"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::Event;
    use crate::storage::SqliteBackend;
    use chrono::Utc;

    async fn engine_with_fixture() -> Arc<QueryEngine> {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let engine = QueryEngine::new(storage.clone(), &QueryConfig::default());

        let now = Utc::now();
        let fixtures = [("web-01", 3u8), ("web-01", 4), ("db", 2)];
        let events: Vec<Event> = fixtures
            .iter()
            .enumerate()
            .map(|(i, (host, sev))| {
                let mut e = Event::default();
                e.hostname = host.to_string();
                e.severity = *sev;
                e.message = format!("event {i}");
                e.timestamp = now - chrono::Duration::minutes(i as i64 + 1);
                e.received_at = e.timestamp;
                e
            })
            .collect();
        storage.insert_batch("default", &events).await.unwrap();
        engine
    }

    fn request(query: &str) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            earliest: Some("-1h".to_string()),
            latest: None,
            extract_fields: false,
            source_type: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filtered_stats_count_matches_spec_fixture() {
        let engine = engine_with_fixture().await;
        let resp = engine
            .execute(&request("search host=web-01 severity<=3 | stats count"))
            .await
            .unwrap();
        assert_eq!(resp.count, 1);
        assert_eq!(resp.results[0]["count"], serde_json::json!(1));
        assert_eq!(resp.backend, "relational");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn validate_true_implies_plan_succeeds() {
        let engine = engine_with_fixture().await;
        let queries = [
            "search * | stats count by hostname",
            "search severity<=3 | timechart span=5m count",
            "search * | top 5 hostname",
            "search * | eval b = severity * 2 | where b > 4 | sort desc b",
        ];
        for q in queries {
            let v = engine.validate_query(q).unwrap();
            assert!(v.valid, "{q}");
            engine.execute(&request(q)).await.unwrap_or_else(|e| {
                panic!("{q}: {e}");
            });
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parse_error_carries_position() {
        let engine = engine_with_fixture().await;
        let err = engine
            .execute(&request("search * | frobnicate"))
            .await
            .unwrap_err();
        match err {
            QueryError::Parse { line, column, .. } => {
                assert_eq!(line, 1);
                assert!(column > 10);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_field_yields_empty_results() {
        let engine = engine_with_fixture().await;
        let resp = engine
            .execute(&request("search nonexistent_field=zzz"))
            .await
            .unwrap();
        assert_eq!(resp.count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn top_equals_spelled_out_form() {
        let engine = engine_with_fixture().await;
        let top = engine
            .execute(&request("search * | top 2 hostname"))
            .await
            .unwrap();
        let spelled = engine
            .execute(&request(
                "search * | stats count by hostname | sort desc count | limit 2",
            ))
            .await
            .unwrap();
        assert_eq!(top.results, spelled.results);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn type_mismatch_warns_and_matches_nothing() {
        let engine = engine_with_fixture().await;
        let resp = engine
            .execute(&request("search severity=\"high\""))
            .await
            .unwrap();
        assert_eq!(resp.count, 0);
        assert!(!resp.warnings.is_empty());
    }

    #[test]
    fn variable_substitution() {
        let vars = vec![("host".to_string(), "web-01".to_string())];
        assert_eq!(
            substitute_variables("search host=$host$ | stats count", &vars),
            "search host=web-01 | stats count"
        );
    }
}

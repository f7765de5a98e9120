use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::dsl::ast::{AggCall, AggFunc, CmpOp, Expr, FilterExpr, SortDir, Value};
use crate::dsl::eval::{as_number, as_string, eval_expr};
use crate::dsl::timerange::bucket_of;
use crate::error::QueryError;
use crate::extract::grok::cached_regex;
use crate::storage::Row;

/// Relational array-lane finisher: reduce a `json_group_array` column to the
/// aggregate the dialect could not compute natively.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayFinish {
    pub source: String,
    pub target: String,
    pub func: AggFunc,
}

/// One client-side operation, applied in order after the SQL rows arrive.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    Filter(FilterExpr),
    Eval(Vec<(String, Expr)>),
    Rex {
        field: String,
        pattern: String,
    },
    Bin {
        span_millis: u64,
        field: String,
        target: String,
    },
    Aggregate {
        aggs: Vec<AggCall>,
        by: Vec<String>,
    },
    FinishArrays(Vec<ArrayFinish>),
    TimechartFill {
        span_millis: u64,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
        /// (column, zero_fill) per aggregate output.
        value_cols: Vec<(String, bool)>,
        by: Vec<String>,
    },
    Sort(Vec<(String, SortDir)>),
    Limit(u64),
    Head(u64),
    Tail(u64),
    Dedup(Vec<String>),
    Fields {
        exclude: bool,
        fields: Vec<String>,
    },
    Rename(Vec<(String, String)>),
    Table(Vec<String>),
}

pub struct PostProcessor {
    pub row_cap: usize,
}

/// Gap filling stops expanding past this many buckets.
const MAX_FILL_BUCKETS: usize = 10_000;

impl PostProcessor {
    pub fn new(row_cap: usize) -> Self {
        Self { row_cap }
    }

    /// Deterministic on identical input orderings; caps output at `row_cap`.
    pub fn apply(&self, ops: &[PostOp], mut rows: Vec<Row>) -> Result<Vec<Row>, QueryError> {
        for op in ops {
            rows = self.apply_one(op, rows)?;
            if rows.len() > self.row_cap {
                rows.truncate(self.row_cap);
            }
        }
        // Internal columns never reach the caller.
        for row in &mut rows {
            row.retain(|k, _| !k.starts_with("__"));
        }
        Ok(rows)
    }

    fn apply_one(&self, op: &PostOp, rows: Vec<Row>) -> Result<Vec<Row>, QueryError> {
        match op {
            PostOp::Filter(expr) => Ok(rows
                .into_iter()
                .filter(|row| filter_matches(expr, row))
                .collect()),
            PostOp::Eval(assignments) => {
                let mut rows = rows;
                for row in &mut rows {
                    for (name, expr) in assignments {
                        let v = eval_expr(expr, row);
                        row.insert(name.clone(), v);
                    }
                }
                Ok(rows)
            }
            PostOp::Rex { field, pattern } => {
                let re = cached_regex(pattern)
                    .map_err(|e| QueryError::Extraction(format!("rex: {e}")))?;
                let names: Vec<String> = re
                    .capture_names()
                    .flatten()
                    .map(|s| s.to_string())
                    .collect();
                let mut rows = rows;
                for row in &mut rows {
                    let Some(text) = field_value(row, field).map(|v| as_string(&v)) else {
                        continue;
                    };
                    if let Some(caps) = re.captures(&text) {
                        for name in &names {
                            if let Some(m) = caps.name(name) {
                                let extracted = Json::String(m.as_str().to_string());
                                if let Some(old) = row.get(name).cloned() {
                                    // Extracted value wins; the original stays
                                    // reachable under raw.<name>.
                                    row.insert(format!("raw.{name}"), old);
                                }
                                row.insert(name.clone(), extracted);
                            }
                        }
                    }
                }
                Ok(rows)
            }
            PostOp::Bin {
                span_millis,
                field,
                target,
            } => {
                let mut rows = rows;
                for row in &mut rows {
                    let Some(v) = field_value(row, field) else { continue };
                    let binned = match parse_timestamp(&v) {
                        Some(t) => Json::String(format_bucket(
                            bucket_of(t, *span_millis),
                            *span_millis,
                        )),
                        None => match as_number(&v) {
                            Some(x) => {
                                let step = *span_millis as f64;
                                serde_json::Number::from_f64((x / step).floor() * step)
                                    .map(Json::Number)
                                    .unwrap_or(Json::Null)
                            }
                            None => Json::Null,
                        },
                    };
                    row.insert(target.clone(), binned);
                }
                Ok(rows)
            }
            PostOp::Aggregate { aggs, by } => Ok(aggregate_rows(&rows, aggs, by)),
            PostOp::FinishArrays(finishers) => {
                let mut rows = rows;
                for row in &mut rows {
                    for fin in finishers {
                        let arr = match row.shift_remove(&fin.source) {
                            Some(Json::Array(items)) => items,
                            Some(other) => vec![other],
                            None => Vec::new(),
                        };
                        row.insert(fin.target.clone(), finish_array(fin.func, arr));
                    }
                }
                Ok(rows)
            }
            PostOp::TimechartFill {
                span_millis,
                earliest,
                latest,
                value_cols,
                by,
            } => Ok(fill_time_gaps(rows, *span_millis, *earliest, *latest, value_cols, by)),
            PostOp::Sort(keys) => {
                let mut rows = rows;
                rows.sort_by(|a, b| {
                    for (field, dir) in keys {
                        let va = field_value(a, field);
                        let vb = field_value(b, field);
                        let ord = compare_values(va.as_ref(), vb.as_ref());
                        let ord = if *dir == SortDir::Desc { ord.reverse() } else { ord };
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
                Ok(rows)
            }
            PostOp::Limit(n) | PostOp::Head(n) => {
                let mut rows = rows;
                rows.truncate(*n as usize);
                Ok(rows)
            }
            PostOp::Tail(n) => {
                let n = *n as usize;
                let skip = rows.len().saturating_sub(n);
                Ok(rows.into_iter().skip(skip).collect())
            }
            PostOp::Dedup(fields) => {
                let mut seen = HashSet::new();
                Ok(rows
                    .into_iter()
                    .filter(|row| {
                        let key: Vec<String> = fields
                            .iter()
                            .map(|f| field_value(row, f).map(|v| as_string(&v)).unwrap_or_default())
                            .collect();
                        seen.insert(key)
                    })
                    .collect())
            }
            PostOp::Fields { exclude, fields } => {
                let mut rows = rows;
                for row in &mut rows {
                    if *exclude {
                        for f in fields {
                            row.shift_remove(f);
                        }
                    } else {
                        let keep: HashSet<&str> = fields.iter().map(String::as_str).collect();
                        row.retain(|k, _| keep.contains(k.as_str()));
                    }
                }
                Ok(rows)
            }
            PostOp::Rename(pairs) => {
                let mut rows = rows;
                for row in &mut rows {
                    for (from, to) in pairs {
                        if let Some(v) = row.shift_remove(from) {
                            row.insert(to.clone(), v);
                        }
                    }
                }
                Ok(rows)
            }
            PostOp::Table(fields) => Ok(rows
                .into_iter()
                .map(|row| {
                    let mut out = Row::new();
                    for f in fields {
                        out.insert(
                            f.clone(),
                            field_value(&row, f).unwrap_or(Json::Null),
                        );
                    }
                    out
                })
                .collect()),
        }
    }
}

/// Resolve a field against a row, falling back to the structured_data map
/// (dotted keys are stored flat).
pub fn field_value(row: &Row, name: &str) -> Option<Json> {
    if let Some(v) = row.get(name) {
        return Some(v.clone());
    }
    let key = name.strip_prefix("structured.").unwrap_or(name);
    match row.get("structured_data") {
        Some(Json::Object(map)) => map.get(key).cloned(),
        _ => None,
    }
}

fn parse_timestamp(v: &Json) -> Option<DateTime<Utc>> {
    let Json::String(s) = v else { return None };
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|t| chrono::TimeZone::from_utc_datetime(&Utc, &t))
        })
}

fn format_bucket(t: DateTime<Utc>, span_millis: u64) -> String {
    if span_millis % 1000 == 0 {
        t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    } else {
        t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }
}

/// Null orders last; numbers order before strings.
pub fn compare_values(a: Option<&Json>, b: Option<&Json>) -> Ordering {
    match (a, b) {
        (None | Some(Json::Null), None | Some(Json::Null)) => Ordering::Equal,
        (None | Some(Json::Null), Some(_)) => Ordering::Greater,
        (Some(_), None | Some(Json::Null)) => Ordering::Less,
        (Some(x), Some(y)) => match (as_number(x), as_number(y)) {
            (Some(nx), Some(ny)) => nx.partial_cmp(&ny).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => as_string(x).cmp(&as_string(y)),
        },
    }
}

fn filter_matches(expr: &FilterExpr, row: &Row) -> bool {
    match expr {
        FilterExpr::And(a, b) => filter_matches(a, row) && filter_matches(b, row),
        FilterExpr::Or(a, b) => filter_matches(a, row) || filter_matches(b, row),
        FilterExpr::Not(e) => !filter_matches(e, row),
        FilterExpr::MatchAll => true,
        FilterExpr::Compare { field, op, value } => {
            let Some(actual) = field_value(row, field) else {
                // Absent paths compare false.
                return false;
            };
            match op {
                CmpOp::Match => {
                    let text = as_string(&actual);
                    let pattern = match value {
                        Value::Str(s) => s.clone(),
                        Value::Int(i) => i.to_string(),
                        Value::Float(x) => x.to_string(),
                    };
                    match cached_regex(&format!("(?i){pattern}")) {
                        Ok(re) => re.is_match(&text),
                        Err(_) => text.to_lowercase().contains(&pattern.to_lowercase()),
                    }
                }
                _ => {
                    let ord = match value {
                        Value::Int(i) => as_number(&actual).map(|x| {
                            x.partial_cmp(&(*i as f64)).unwrap_or(Ordering::Equal)
                        }),
                        Value::Float(f) => as_number(&actual)
                            .map(|x| x.partial_cmp(f).unwrap_or(Ordering::Equal)),
                        Value::Str(s) => Some(as_string(&actual).cmp(s)),
                    };
                    let Some(ord) = ord else { return false };
                    match op {
                        CmpOp::Eq => ord.is_eq(),
                        CmpOp::Ne => !ord.is_eq(),
                        CmpOp::Lt => ord.is_lt(),
                        CmpOp::Le => ord.is_le(),
                        CmpOp::Gt => ord.is_gt(),
                        CmpOp::Ge => ord.is_ge(),
                        CmpOp::Match => unreachable!(),
                    }
                }
            }
        }
    }
}

// ── Client-side aggregation ──

fn aggregate_rows(rows: &[Row], aggs: &[AggCall], by: &[String]) -> Vec<Row> {
    let mut order: Vec<Vec<String>> = Vec::new();
    let mut groups: HashMap<Vec<String>, Vec<&Row>> = HashMap::new();
    for row in rows {
        let key: Vec<String> = by
            .iter()
            .map(|f| field_value(row, f).map(|v| as_string(&v)).unwrap_or_default())
            .collect();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(row);
    }
    if by.is_empty() && groups.is_empty() {
        // `stats count` over zero rows still yields one row.
        order.push(Vec::new());
        groups.insert(Vec::new(), Vec::new());
    }

    order
        .into_iter()
        .map(|key| {
            let members = &groups[&key];
            let mut out = Row::new();
            for (field, value) in by.iter().zip(key.iter()) {
                out.insert(field.clone(), Json::String(value.clone()));
            }
            for agg in aggs {
                out.insert(agg.output_name(), compute_agg(agg, members));
            }
            out
        })
        .collect()
}

fn compute_agg(agg: &AggCall, rows: &[&Row]) -> Json {
    if agg.func == AggFunc::Count {
        return Json::Number((rows.len() as u64).into());
    }
    let field = agg.field.as_deref().unwrap_or("");
    let values: Vec<Json> = rows
        .iter()
        .filter_map(|row| field_value(row, field))
        .filter(|v| !v.is_null())
        .collect();

    match agg.func {
        AggFunc::Count => unreachable!(),
        AggFunc::Dc => {
            let distinct: HashSet<String> = values.iter().map(as_string).collect();
            Json::Number((distinct.len() as u64).into())
        }
        AggFunc::Values => {
            let mut seen = HashSet::new();
            Json::Array(
                values
                    .into_iter()
                    .filter(|v| seen.insert(as_string(v)))
                    .collect(),
            )
        }
        AggFunc::List => Json::Array(values),
        AggFunc::First => values.first().cloned().unwrap_or(Json::Null),
        AggFunc::Last => values.last().cloned().unwrap_or(Json::Null),
        AggFunc::Earliest | AggFunc::Latest => {
            let mut pairs: Vec<(Option<DateTime<Utc>>, usize)> = Vec::new();
            for (i, row) in rows.iter().enumerate() {
                if field_value(row, field).is_some_and(|v| !v.is_null()) {
                    pairs.push((row.get("timestamp").and_then(parse_timestamp), i));
                }
            }
            if pairs.is_empty() {
                return Json::Null;
            }
            pairs.sort();
            let idx = if agg.func == AggFunc::Earliest {
                pairs[0].1
            } else {
                pairs[pairs.len() - 1].1
            };
            field_value(rows[idx], field).unwrap_or(Json::Null)
        }
        AggFunc::Mode => {
            let mut counts: HashMap<String, (u64, &Json)> = HashMap::new();
            for v in &values {
                let entry = counts.entry(as_string(v)).or_insert((0, v));
                entry.0 += 1;
            }
            counts
                .into_iter()
                .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.0.cmp(&a.0)))
                .map(|(_, (_, v))| v.clone())
                .unwrap_or(Json::Null)
        }
        AggFunc::Min | AggFunc::Max => {
            if values.is_empty() {
                return Json::Null;
            }
            let mut sorted: Vec<&Json> = values.iter().collect();
            sorted.sort_by(|a, b| compare_values(Some(a), Some(b)));
            if agg.func == AggFunc::Min {
                (*sorted.first().unwrap()).clone()
            } else {
                (*sorted.last().unwrap()).clone()
            }
        }
        AggFunc::Sum
        | AggFunc::Avg
        | AggFunc::Stddev
        | AggFunc::Variance
        | AggFunc::Range
        | AggFunc::Median
        | AggFunc::Percentile(_) => {
            let nums: Vec<f64> = values.iter().filter_map(as_number).collect();
            numeric_agg(agg.func, &nums)
        }
    }
}

fn numeric_agg(func: AggFunc, nums: &[f64]) -> Json {
    if nums.is_empty() {
        return Json::Null;
    }
    let n = nums.len() as f64;
    let sum: f64 = nums.iter().sum();
    let value = match func {
        AggFunc::Sum => sum,
        AggFunc::Avg => sum / n,
        AggFunc::Range => {
            let min = nums.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = nums.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            max - min
        }
        AggFunc::Variance | AggFunc::Stddev => {
            let mean = sum / n;
            let var = nums.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            if func == AggFunc::Variance { var } else { var.sqrt() }
        }
        AggFunc::Median => percentile(nums, 50.0),
        AggFunc::Percentile(p) => percentile(nums, p as f64),
        _ => unreachable!(),
    };
    serde_json::Number::from_f64(value)
        .map(Json::Number)
        .unwrap_or(Json::Null)
}

/// Linear-interpolated percentile over an unsorted slice.
pub fn percentile(nums: &[f64], p: f64) -> f64 {
    let mut sorted = nums.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

fn finish_array(func: AggFunc, items: Vec<Json>) -> Json {
    match func {
        AggFunc::Values | AggFunc::List => Json::Array(items),
        AggFunc::First | AggFunc::Earliest => items.first().cloned().unwrap_or(Json::Null),
        AggFunc::Last | AggFunc::Latest => items.last().cloned().unwrap_or(Json::Null),
        AggFunc::Mode => {
            let mut counts: HashMap<String, (u64, Json)> = HashMap::new();
            for v in items {
                let key = as_string(&v);
                let entry = counts.entry(key).or_insert((0, v));
                entry.0 += 1;
            }
            counts
                .into_iter()
                .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.0.cmp(&a.0)))
                .map(|(_, (_, v))| v)
                .unwrap_or(Json::Null)
        }
        AggFunc::Median | AggFunc::Percentile(_) => {
            let nums: Vec<f64> = items.iter().filter_map(as_number).collect();
            if nums.is_empty() {
                return Json::Null;
            }
            let p = match func {
                AggFunc::Median => 50.0,
                AggFunc::Percentile(p) => p as f64,
                _ => unreachable!(),
            };
            serde_json::Number::from_f64(percentile(&nums, p))
                .map(Json::Number)
                .unwrap_or(Json::Null)
        }
        _ => Json::Null,
    }
}

// ── Timechart gap filling ──

fn fill_time_gaps(
    rows: Vec<Row>,
    span_millis: u64,
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
    value_cols: &[(String, bool)],
    by: &[String],
) -> Vec<Row> {
    let span = span_millis.max(1);
    let first = bucket_of(earliest, span);
    let last = bucket_of(latest, span);
    let bucket_count = ((last - first).num_milliseconds() / span as i64 + 1).max(0) as usize;
    if bucket_count == 0 || bucket_count > MAX_FILL_BUCKETS {
        return rows;
    }

    // Canonicalize bucket strings so both dialects agree.
    let mut canonical: Vec<Row> = rows;
    for row in &mut canonical {
        if let Some(v) = row.get("_time").cloned() {
            if let Some(t) = parse_timestamp(&v) {
                row.insert(
                    "_time".to_string(),
                    Json::String(format_bucket(bucket_of(t, span), span)),
                );
            }
        }
    }

    let mut group_keys: Vec<Vec<String>> = Vec::new();
    let mut present: HashMap<(String, Vec<String>), Row> = HashMap::new();
    for row in canonical {
        let bucket = row
            .get("_time")
            .map(|v| as_string(v))
            .unwrap_or_default();
        let key: Vec<String> = by
            .iter()
            .map(|f| field_value(&row, f).map(|v| as_string(&v)).unwrap_or_default())
            .collect();
        if !group_keys.contains(&key) {
            group_keys.push(key.clone());
        }
        present.insert((bucket, key), row);
    }
    if group_keys.is_empty() {
        group_keys.push(by.iter().map(|_| String::new()).collect());
    }

    let mut out = Vec::with_capacity(bucket_count * group_keys.len());
    for i in 0..bucket_count {
        let t = first + chrono::Duration::milliseconds((i as u64 * span) as i64);
        let bucket = format_bucket(t, span);
        for key in &group_keys {
            if let Some(row) = present.remove(&(bucket.clone(), key.clone())) {
                out.push(row);
                continue;
            }
            // Zero rows for count aggregates, nulls otherwise.
            let mut row = Row::new();
            row.insert("_time".to_string(), Json::String(bucket.clone()));
            for (field, value) in by.iter().zip(key.iter()) {
                row.insert(field.clone(), Json::String(value.clone()));
            }
            for (col, zero) in value_cols {
                row.insert(
                    col.clone(),
                    if *zero {
                        Json::Number(0u64.into())
                    } else {
                        Json::Null
                    },
                );
            }
            out.push(row);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(pairs: &[(&str, Json)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn event_rows() -> Vec<Row> {
        vec![
            row(&[
                ("timestamp", json!("2023-10-10T13:00:05Z")),
                ("hostname", json!("web-01")),
                ("severity", json!(3)),
                ("message", json!("error: disk full")),
            ]),
            row(&[
                ("timestamp", json!("2023-10-10T13:30:00Z")),
                ("hostname", json!("web-01")),
                ("severity", json!(4)),
                ("message", json!("warn: slow request")),
            ]),
            row(&[
                ("timestamp", json!("2023-10-10T14:30:00Z")),
                ("hostname", json!("db")),
                ("severity", json!(2)),
                ("message", json!("error: oom")),
            ]),
        ]
    }

    #[test]
    fn client_side_count_matches_filters() {
        let pp = PostProcessor::new(10_000);
        let ops = vec![
            PostOp::Filter(FilterExpr::Compare {
                field: "severity".to_string(),
                op: CmpOp::Le,
                value: Value::Int(3),
            }),
            PostOp::Aggregate {
                aggs: vec![AggCall {
                    func: AggFunc::Count,
                    field: None,
                    alias: None,
                }],
                by: vec![],
            },
        ];
        let out = pp.apply(&ops, event_rows()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["count"], json!(2));
    }

    #[test]
    fn count_over_zero_rows_is_one_zero_row() {
        let pp = PostProcessor::new(10_000);
        let ops = vec![PostOp::Aggregate {
            aggs: vec![AggCall {
                func: AggFunc::Count,
                field: None,
                alias: None,
            }],
            by: vec![],
        }];
        let out = pp.apply(&ops, vec![]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["count"], json!(0));
    }

    #[test]
    fn timechart_buckets_and_zero_fills() {
        // Events at t, t+30m, t+90m with span 1h: buckets t (2) and t+1h (1).
        let pp = PostProcessor::new(10_000);
        let earliest = Utc.with_ymd_and_hms(2023, 10, 10, 13, 0, 0).unwrap();
        let latest = Utc.with_ymd_and_hms(2023, 10, 10, 14, 59, 0).unwrap();
        let ops = vec![
            PostOp::Bin {
                span_millis: 3_600_000,
                field: "timestamp".to_string(),
                target: "_time".to_string(),
            },
            PostOp::Aggregate {
                aggs: vec![AggCall {
                    func: AggFunc::Count,
                    field: None,
                    alias: None,
                }],
                by: vec!["_time".to_string()],
            },
            PostOp::TimechartFill {
                span_millis: 3_600_000,
                earliest,
                latest,
                value_cols: vec![("count".to_string(), true)],
                by: vec![],
            },
        ];
        let out = pp.apply(&ops, event_rows()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_time"], json!("2023-10-10T13:00:00Z"));
        assert_eq!(out[0]["count"], json!(2));
        assert_eq!(out[1]["_time"], json!("2023-10-10T14:00:00Z"));
        assert_eq!(out[1]["count"], json!(1));
    }

    #[test]
    fn gap_fill_inserts_zero_buckets() {
        let pp = PostProcessor::new(10_000);
        let earliest = Utc.with_ymd_and_hms(2023, 10, 10, 13, 0, 0).unwrap();
        let latest = Utc.with_ymd_and_hms(2023, 10, 10, 16, 0, 0).unwrap();
        let rows = vec![row(&[
            ("_time", json!("2023-10-10T13:00:00Z")),
            ("count", json!(5)),
        ])];
        let ops = vec![PostOp::TimechartFill {
            span_millis: 3_600_000,
            earliest,
            latest,
            value_cols: vec![("count".to_string(), true)],
            by: vec![],
        }];
        let out = pp.apply(&ops, rows).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[1]["count"], json!(0));
        assert_eq!(out[3]["_time"], json!("2023-10-10T16:00:00Z"));
    }

    #[test]
    fn non_count_aggregates_null_fill() {
        let pp = PostProcessor::new(10_000);
        let earliest = Utc.with_ymd_and_hms(2023, 10, 10, 13, 0, 0).unwrap();
        let latest = Utc.with_ymd_and_hms(2023, 10, 10, 14, 0, 0).unwrap();
        let rows = vec![row(&[
            ("_time", json!("2023-10-10T13:00:00Z")),
            ("avg(severity)", json!(3.5)),
        ])];
        let ops = vec![PostOp::TimechartFill {
            span_millis: 3_600_000,
            earliest,
            latest,
            value_cols: vec![("avg(severity)".to_string(), false)],
            by: vec![],
        }];
        let out = pp.apply(&ops, rows).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["avg(severity)"], Json::Null);
    }

    #[test]
    fn rex_extracts_and_preserves_collisions() {
        let pp = PostProcessor::new(10_000);
        let rows = vec![row(&[
            ("message", json!("status=404 path=/health")),
            ("status", json!("existing")),
        ])];
        let ops = vec![PostOp::Rex {
            field: "message".to_string(),
            pattern: r"status=(?P<status>\d+)".to_string(),
        }];
        let out = pp.apply(&ops, rows).unwrap();
        assert_eq!(out[0]["status"], json!("404"));
        assert_eq!(out[0]["raw.status"], json!("existing"));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let pp = PostProcessor::new(10_000);
        let ops = vec![PostOp::Dedup(vec!["hostname".to_string()])];
        let out = pp.apply(&ops, event_rows()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["severity"], json!(3));
    }

    #[test]
    fn sort_orders_nulls_last() {
        let pp = PostProcessor::new(10_000);
        let rows = vec![
            row(&[("v", Json::Null)]),
            row(&[("v", json!(5))]),
            row(&[("v", json!(1))]),
        ];
        let ops = vec![PostOp::Sort(vec![("v".to_string(), SortDir::Asc)])];
        let out = pp.apply(&ops, rows).unwrap();
        assert_eq!(out[0]["v"], json!(1));
        assert_eq!(out[2]["v"], Json::Null);
    }

    #[test]
    fn table_projects_in_order() {
        let pp = PostProcessor::new(10_000);
        let ops = vec![PostOp::Table(vec![
            "severity".to_string(),
            "hostname".to_string(),
        ])];
        let out = pp.apply(&ops, event_rows()).unwrap();
        let keys: Vec<&String> = out[0].keys().collect();
        assert_eq!(keys, vec!["severity", "hostname"]);
    }

    #[test]
    fn finish_arrays_computes_percentile() {
        let pp = PostProcessor::new(10_000);
        let rows = vec![row(&[
            ("hostname", json!("h")),
            ("__arr_p95(ms)", json!([10.0, 20.0, 30.0, 40.0])),
        ])];
        let ops = vec![PostOp::FinishArrays(vec![ArrayFinish {
            source: "__arr_p95(ms)".to_string(),
            target: "p95(ms)".to_string(),
            func: AggFunc::Percentile(95),
        }])];
        let out = pp.apply(&ops, rows).unwrap();
        let v = as_number(&out[0]["p95(ms)"]).unwrap();
        assert!((v - 38.5).abs() < 1e-9, "{v}");
    }

    #[test]
    fn percentile_interpolates() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&xs, 50.0) - 2.5).abs() < 1e-9);
        assert!((percentile(&xs, 0.0) - 1.0).abs() < 1e-9);
        assert!((percentile(&xs, 100.0) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn structured_fallback_resolves_dotted_paths() {
        let r = row(&[(
            "structured_data",
            json!({"response.code": "200"}),
        )]);
        assert_eq!(
            field_value(&r, "response.code"),
            Some(json!("200"))
        );
        assert_eq!(
            field_value(&r, "structured.response.code"),
            Some(json!("200"))
        );
    }
}

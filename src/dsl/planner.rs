use std::collections::HashMap;

use crate::dsl::ast::*;
use crate::dsl::eval::sql_lowerable;
use crate::dsl::postprocess::{ArrayFinish, PostOp};
use crate::dsl::timerange::{parse_instant, TimeRange};
use crate::error::QueryError;
use crate::models::event::{is_event_column, EVENT_COLUMNS};
use crate::storage::{Dialect, SqlParam};

/// Row caps bounding post-processor memory.
pub const DEFAULT_PRE_AGG_CAP: u64 = 50_000;
pub const DEFAULT_POST_AGG_CAP: u64 = 10_000;

/// Output column holding the timechart bucket.
pub const TIME_BUCKET_COL: &str = "_time";

/// A compiled query: one SELECT plus the client-side tail.
#[derive(Debug)]
pub struct Plan {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub post_ops: Vec<PostOp>,
    pub warnings: Vec<String>,
}

pub struct Planner {
    pub dialect: Dialect,
    pub pre_agg_cap: u64,
    pub post_agg_cap: u64,
}

/// Accumulates typed parameters and hands back dialect placeholders.
struct ParamSink {
    dialect: Dialect,
    params: Vec<SqlParam>,
}

impl ParamSink {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn push(&mut self, p: SqlParam) -> String {
        let idx = self.params.len();
        let placeholder = match self.dialect {
            Dialect::Columnar => format!("{{p{idx}:{}}}", p.ch_type()),
            Dialect::Relational => format!("?{}", idx + 1),
        };
        self.params.push(p);
        placeholder
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', ""))
}

/// Broad column classes driving comparison coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Numeric,
    Timestamp,
    Ip,
    Text,
    Structured,
}

fn column_kind(name: &str) -> ColumnKind {
    match name {
        "severity" | "facility" | "priority" | "source_port" => ColumnKind::Numeric,
        "timestamp" | "received_at" => ColumnKind::Timestamp,
        "source_ip" => ColumnKind::Ip,
        _ if is_event_column(name) => ColumnKind::Text,
        _ => ColumnKind::Structured,
    }
}

impl Planner {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            pre_agg_cap: DEFAULT_PRE_AGG_CAP,
            post_agg_cap: DEFAULT_POST_AGG_CAP,
        }
    }

    /// Compile a validated pipeline against a resolved time range.
    pub fn plan(
        &self,
        pipeline: &Pipeline,
        range: TimeRange,
        source_type: Option<&str>,
    ) -> Result<Plan, QueryError> {
        let mut sink = ParamSink::new(self.dialect);
        let mut warnings = Vec::new();
        let mut post_ops: Vec<PostOp> = Vec::new();
        // Field name -> SQL expression for lowered eval / bin rewrites.
        let mut env: HashMap<String, String> = HashMap::new();
        // Extra projected columns (eval targets), in definition order.
        let mut extra_select: Vec<(String, String)> = Vec::new();

        let mut where_clauses = vec![
            format!(
                "timestamp >= {}",
                sink.push(SqlParam::DateTime(range.earliest))
            ),
            format!("timestamp <= {}", sink.push(SqlParam::DateTime(range.latest))),
        ];
        if let Some(st) = source_type {
            where_clauses.push(format!(
                "app_name = {}",
                sink.push(SqlParam::String(st.to_string()))
            ));
        }

        let agg_idx = pipeline.stages.iter().position(|s| {
            matches!(
                s,
                Stage::Stats { .. } | Stage::Timechart { .. } | Stage::Top { .. } | Stage::Rare { .. }
            )
        });

        // ── Stages ahead of the aggregation barrier ──
        let pre_end = agg_idx.unwrap_or(pipeline.stages.len());
        let mut shaped_in_sql = false;
        let mut order_by: Option<String> = None;
        let mut sql_limit: Option<u64> = None;
        let mut dedup_sql: Option<Vec<String>> = None;

        let mut i = 0;
        while i < pre_end {
            let stage = &pipeline.stages[i];
            match stage {
                Stage::Search(expr) | Stage::Where(expr) => {
                    if post_ops.is_empty() && !shaped_in_sql && sql_limit.is_none() {
                        if let Some(cond) =
                            self.filter_to_sql(expr, &env, &mut sink, &mut warnings)?
                        {
                            where_clauses.push(cond);
                        }
                    } else {
                        post_ops.push(PostOp::Filter(expr.clone()));
                    }
                }
                Stage::Eval(assignments) => {
                    let all_lowerable =
                        assignments.iter().all(|(_, e)| sql_lowerable(e));
                    if all_lowerable && post_ops.is_empty() && !shaped_in_sql {
                        for (name, expr) in assignments {
                            let sql = self.expr_to_sql(expr, &env, &mut sink)?;
                            env.insert(name.clone(), sql.clone());
                            extra_select.retain(|(n, _)| n != name);
                            extra_select.push((name.clone(), sql));
                        }
                    } else {
                        post_ops.push(PostOp::Eval(assignments.clone()));
                    }
                }
                Stage::Rex { field, pattern } => {
                    post_ops.push(PostOp::Rex {
                        field: field.clone(),
                        pattern: pattern.clone(),
                    });
                }
                Stage::Bin { span, field } => {
                    if post_ops.is_empty() && !shaped_in_sql {
                        let expr = self.bin_expr(field, span, &env, &mut sink);
                        env.insert(field.clone(), expr.clone());
                        extra_select.retain(|(n, _)| n != field);
                        extra_select.push((field.clone(), expr));
                    } else {
                        post_ops.push(PostOp::Bin {
                            span_millis: span.as_millis(),
                            field: field.clone(),
                            target: field.clone(),
                        });
                    }
                }
                // Row-shaping ahead of any aggregation.
                Stage::Sort { keys } => {
                    if post_ops.is_empty() && !shaped_in_sql && sql_limit.is_none() {
                        let rendered: Vec<String> = keys
                            .iter()
                            .map(|(field, dir)| {
                                let expr = self.field_expr(field, &env, &mut sink, false);
                                let d = if *dir == SortDir::Desc { "DESC" } else { "ASC" };
                                format!("{expr} {d}")
                            })
                            .collect();
                        order_by = Some(rendered.join(", "));
                        shaped_in_sql = true;
                    } else {
                        post_ops.push(PostOp::Sort(keys.clone()));
                    }
                }
                Stage::Dedup(fields) => {
                    if post_ops.is_empty() && !shaped_in_sql && sql_limit.is_none() {
                        dedup_sql = Some(fields.clone());
                        shaped_in_sql = true;
                    } else {
                        post_ops.push(PostOp::Dedup(fields.clone()));
                    }
                }
                Stage::Limit(n) | Stage::Head(n) => {
                    if post_ops.is_empty() {
                        sql_limit = Some(sql_limit.map_or(*n, |cur| cur.min(*n)));
                    } else {
                        post_ops.push(match stage {
                            Stage::Limit(n) => PostOp::Limit(*n),
                            _ => PostOp::Head(*n),
                        });
                    }
                }
                Stage::Tail(n) => post_ops.push(PostOp::Tail(*n)),
                Stage::Table(fields) => post_ops.push(PostOp::Table(fields.clone())),
                Stage::Fields { exclude, fields } => post_ops.push(PostOp::Fields {
                    exclude: *exclude,
                    fields: fields.clone(),
                }),
                Stage::Rename(pairs) => post_ops.push(PostOp::Rename(pairs.clone())),
                Stage::Stats { .. }
                | Stage::Timechart { .. }
                | Stage::Top { .. }
                | Stage::Rare { .. } => unreachable!("aggregations handled below"),
            }
            i += 1;
        }

        // ── No aggregation: plain filtered select ──
        let Some(agg_idx) = agg_idx else {
            let sql = self.build_select(
                &where_clauses,
                &extra_select,
                order_by.as_deref(),
                sql_limit,
                dedup_sql.as_deref(),
                &env,
                &mut sink,
            );
            return Ok(Plan {
                sql,
                params: sink.params,
                post_ops,
                warnings,
            });
        };

        if shaped_in_sql {
            // A sort/dedup barrier already consumed the SQL; the aggregation
            // and everything after it run client-side over its output.
            let sql = self.build_select(
                &where_clauses,
                &extra_select,
                order_by.as_deref(),
                sql_limit,
                dedup_sql.as_deref(),
                &env,
                &mut sink,
            );
            self.push_tail_post_ops(&pipeline.stages[agg_idx..], &mut post_ops);
            return Ok(Plan {
                sql,
                params: sink.params,
                post_ops,
                warnings,
            });
        }

        // Normalize top/rare into the stats shape they are defined as:
        // `top N f` ≡ `stats count by f | sort desc count | limit N`.
        let (aggs, by, span, implicit_order): (Vec<AggCall>, Vec<String>, Option<Span>, Option<(String, SortDir, u64)>) =
            match &pipeline.stages[agg_idx] {
                Stage::Stats { aggs, by } => (aggs.clone(), by.clone(), None, None),
                Stage::Timechart { span, aggs, by } => {
                    (aggs.clone(), by.clone(), Some(*span), None)
                }
                Stage::Top { n, field } => (
                    vec![AggCall { func: AggFunc::Count, field: None, alias: None }],
                    vec![field.clone()],
                    None,
                    Some(("count".to_string(), SortDir::Desc, *n)),
                ),
                Stage::Rare { n, field } => (
                    vec![AggCall { func: AggFunc::Count, field: None, alias: None }],
                    vec![field.clone()],
                    None,
                    Some(("count".to_string(), SortDir::Asc, *n)),
                ),
                _ => unreachable!(),
            };

        // A pre-aggregation limit caps raw rows, not groups, so it also
        // pushes the aggregation client-side.
        let forced = !post_ops.is_empty() || sql_limit.is_some();
        if forced {
            let sql = self.build_select(
                &where_clauses,
                &extra_select,
                None,
                sql_limit,
                None,
                &env,
                &mut sink,
            );
            if let Some(span) = span {
                post_ops.push(PostOp::Bin {
                    span_millis: span.as_millis(),
                    field: "timestamp".to_string(),
                    target: TIME_BUCKET_COL.to_string(),
                });
                let mut group = vec![TIME_BUCKET_COL.to_string()];
                group.extend(by.iter().cloned());
                post_ops.push(PostOp::Aggregate { aggs: aggs.clone(), by: group });
                post_ops.push(PostOp::Sort(vec![(TIME_BUCKET_COL.to_string(), SortDir::Asc)]));
                post_ops.push(self.fill_op(&aggs, &by, span, range));
            } else {
                post_ops.push(PostOp::Aggregate { aggs: aggs.clone(), by: by.clone() });
            }
            if let Some((col, dir, n)) = implicit_order {
                post_ops.push(PostOp::Sort(vec![(col, dir)]));
                post_ops.push(PostOp::Limit(n));
            }
            self.push_tail_post_ops(&pipeline.stages[agg_idx + 1..], &mut post_ops);
            return Ok(Plan {
                sql,
                params: sink.params,
                post_ops,
                warnings,
            });
        }

        // ── Server-side GROUP BY ──
        let mut select_cols: Vec<String> = Vec::new();
        let mut group_cols: Vec<String> = Vec::new();
        let mut sortable: Vec<String> = Vec::new();
        let mut finishers: Vec<ArrayFinish> = Vec::new();

        if let Some(span) = span {
            let bucket = self.time_bucket_expr(span.as_secs().max(1));
            select_cols.push(format!("{bucket} AS {}", quote_ident(TIME_BUCKET_COL)));
            group_cols.push(quote_ident(TIME_BUCKET_COL));
            sortable.push(TIME_BUCKET_COL.to_string());
        }
        for field in &by {
            let expr = self.field_expr(field, &env, &mut sink, false);
            select_cols.push(format!("{expr} AS {}", quote_ident(field)));
            group_cols.push(quote_ident(field));
            sortable.push(field.clone());
        }
        for agg in &aggs {
            let output = agg.output_name();
            let (expr, finish) = self.agg_expr(agg, &env, &mut sink);
            match finish {
                Some(func) => {
                    let source = format!("__arr_{output}");
                    select_cols.push(format!("{expr} AS {}", quote_ident(&source)));
                    finishers.push(ArrayFinish {
                        source,
                        target: output.clone(),
                        func,
                    });
                }
                None => {
                    select_cols.push(format!("{expr} AS {}", quote_ident(&output)));
                    sortable.push(output.clone());
                }
            }
        }

        // Stages directly after the barrier that still lower into this SELECT.
        let mut tail = &pipeline.stages[agg_idx + 1..];
        let mut agg_limit: Option<u64> = None;
        let mut agg_order: Option<String> = implicit_order
            .as_ref()
            .map(|(col, dir, n)| {
                agg_limit = Some(*n);
                format!(
                    "{} {}",
                    quote_ident(col),
                    if *dir == SortDir::Desc { "DESC" } else { "ASC" }
                )
            });
        // Gap filling rebuilds timechart rows client-side, so sort/limit
        // after a timechart must run after the fill, not in SQL.
        if span.is_none() {
            if agg_order.is_none() {
                if let Some(Stage::Sort { keys }) = tail.first() {
                    if keys.iter().all(|(k, _)| sortable.contains(k)) {
                        let rendered: Vec<String> = keys
                            .iter()
                            .map(|(k, dir)| {
                                format!(
                                    "{} {}",
                                    quote_ident(k),
                                    if *dir == SortDir::Desc { "DESC" } else { "ASC" }
                                )
                            })
                            .collect();
                        agg_order = Some(rendered.join(", "));
                        tail = &tail[1..];
                    }
                }
            }
            if let Some(Stage::Limit(n) | Stage::Head(n)) = tail.first() {
                agg_limit = Some(agg_limit.map_or(*n, |cur| cur.min(*n)));
                tail = &tail[1..];
            }
        }

        let order_clause = agg_order.or_else(|| {
            span.map(|_| format!("{} ASC", quote_ident(TIME_BUCKET_COL)))
        });

        let limit = agg_limit.unwrap_or(self.post_agg_cap).min(self.post_agg_cap);
        let limit_ph = sink.push(SqlParam::UInt32(limit.min(u32::MAX as u64) as u32));
        let mut sql = format!(
            "SELECT {} FROM events WHERE {} GROUP BY {}",
            select_cols.join(", "),
            where_clauses.join(" AND "),
            group_cols.join(", "),
        );
        if let Some(ob) = order_clause {
            sql.push_str(&format!(" ORDER BY {ob}"));
        }
        sql.push_str(&format!(" LIMIT {limit_ph}"));

        if !finishers.is_empty() {
            post_ops.push(PostOp::FinishArrays(finishers));
        }
        if let Some(span) = span {
            post_ops.push(self.fill_op(&aggs, &by, span, range));
        }
        self.push_tail_post_ops(tail, &mut post_ops);

        Ok(Plan {
            sql,
            params: sink.params,
            post_ops,
            warnings,
        })
    }

    /// Remaining pipeline stages become client-side operations, in order.
    fn push_tail_post_ops(&self, stages: &[Stage], post_ops: &mut Vec<PostOp>) {
        for stage in stages {
            let op = match stage {
                Stage::Search(e) | Stage::Where(e) => PostOp::Filter(e.clone()),
                Stage::Eval(a) => PostOp::Eval(a.clone()),
                Stage::Rex { field, pattern } => PostOp::Rex {
                    field: field.clone(),
                    pattern: pattern.clone(),
                },
                Stage::Sort { keys } => PostOp::Sort(keys.clone()),
                Stage::Limit(n) => PostOp::Limit(*n),
                Stage::Head(n) => PostOp::Head(*n),
                Stage::Tail(n) => PostOp::Tail(*n),
                Stage::Dedup(f) => PostOp::Dedup(f.clone()),
                Stage::Table(f) => PostOp::Table(f.clone()),
                Stage::Fields { exclude, fields } => PostOp::Fields {
                    exclude: *exclude,
                    fields: fields.clone(),
                },
                Stage::Rename(p) => PostOp::Rename(p.clone()),
                Stage::Bin { span, field } => PostOp::Bin {
                    span_millis: span.as_millis(),
                    field: field.clone(),
                    target: field.clone(),
                },
                Stage::Stats { aggs, by } => PostOp::Aggregate {
                    aggs: aggs.clone(),
                    by: by.clone(),
                },
                Stage::Timechart { span, aggs, by } => {
                    post_ops.push(PostOp::Bin {
                        span_millis: span.as_millis(),
                        field: "timestamp".to_string(),
                        target: TIME_BUCKET_COL.to_string(),
                    });
                    let mut group = vec![TIME_BUCKET_COL.to_string()];
                    group.extend(by.iter().cloned());
                    PostOp::Aggregate {
                        aggs: aggs.clone(),
                        by: group,
                    }
                }
                Stage::Top { n, field } => {
                    post_ops.push(PostOp::Aggregate {
                        aggs: vec![AggCall { func: AggFunc::Count, field: None, alias: None }],
                        by: vec![field.clone()],
                    });
                    post_ops.push(PostOp::Sort(vec![("count".to_string(), SortDir::Desc)]));
                    PostOp::Limit(*n)
                }
                Stage::Rare { n, field } => {
                    post_ops.push(PostOp::Aggregate {
                        aggs: vec![AggCall { func: AggFunc::Count, field: None, alias: None }],
                        by: vec![field.clone()],
                    });
                    post_ops.push(PostOp::Sort(vec![("count".to_string(), SortDir::Asc)]));
                    PostOp::Limit(*n)
                }
            };
            post_ops.push(op);
        }
    }

    fn fill_op(&self, aggs: &[AggCall], by: &[String], span: Span, range: TimeRange) -> PostOp {
        PostOp::TimechartFill {
            span_millis: span.as_millis(),
            earliest: range.earliest,
            latest: range.latest,
            value_cols: aggs
                .iter()
                .map(|a| (a.output_name(), a.func.zero_fills()))
                .collect(),
            by: by.to_vec(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_select(
        &self,
        where_clauses: &[String],
        extra_select: &[(String, String)],
        order_by: Option<&str>,
        sql_limit: Option<u64>,
        dedup: Option<&[String]>,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
    ) -> String {
        let mut cols: Vec<String> = EVENT_COLUMNS
            .iter()
            .map(|c| match env.get(*c) {
                Some(expr) => format!("{expr} AS {}", quote_ident(c)),
                None => (*c).to_string(),
            })
            .collect();
        for (name, expr) in extra_select {
            if !is_event_column(name) {
                cols.push(format!("{expr} AS {}", quote_ident(name)));
            }
        }

        let limit = sql_limit.unwrap_or(self.pre_agg_cap).min(self.pre_agg_cap);
        let limit_ph = sink.push(SqlParam::UInt32(limit.min(u32::MAX as u64) as u32));
        let where_sql = where_clauses.join(" AND ");

        match (self.dialect, dedup) {
            (Dialect::Columnar, Some(fields)) => {
                let by: Vec<String> = fields
                    .iter()
                    .map(|f| self.field_expr(f, env, sink, false))
                    .collect();
                format!(
                    "SELECT {} FROM events WHERE {where_sql} ORDER BY timestamp DESC \
                     LIMIT 1 BY ({}) LIMIT {limit_ph}",
                    cols.join(", "),
                    by.join(", "),
                )
            }
            (Dialect::Relational, Some(fields)) => {
                // Bare-column selection: with a single MAX aggregate SQLite
                // picks the remaining columns from the max-timestamp row.
                let by: Vec<String> = fields
                    .iter()
                    .map(|f| self.field_expr(f, env, sink, false))
                    .collect();
                format!(
                    "SELECT {}, MAX(timestamp) AS __dedup_ts FROM events WHERE {where_sql} \
                     GROUP BY {} ORDER BY timestamp DESC LIMIT {limit_ph}",
                    cols.join(", "),
                    by.join(", "),
                )
            }
            (_, None) => {
                let order = order_by.unwrap_or("timestamp DESC");
                format!(
                    "SELECT {} FROM events WHERE {where_sql} ORDER BY {order} LIMIT {limit_ph}",
                    cols.join(", "),
                )
            }
        }
    }

    // ── Field and expression lowering ──

    fn field_expr(
        &self,
        name: &str,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
        numeric: bool,
    ) -> String {
        if let Some(expr) = env.get(name) {
            return expr.clone();
        }
        if is_event_column(name) {
            return name.to_string();
        }
        // Anything else is a structured-data path; a missing key compares
        // false rather than erroring.
        let key = name.strip_prefix("structured.").unwrap_or(name);
        let access = match self.dialect {
            Dialect::Columnar => {
                let ph = sink.push(SqlParam::String(key.to_string()));
                format!("structured_data[{ph}]")
            }
            Dialect::Relational => {
                let path = format!("$.\"{}\"", key.replace('"', ""));
                let ph = sink.push(SqlParam::String(path));
                format!("json_extract(structured_data, {ph})")
            }
        };
        if numeric {
            match self.dialect {
                Dialect::Columnar => format!("toFloat64OrNull({access})"),
                Dialect::Relational => format!("CAST({access} AS REAL)"),
            }
        } else {
            access
        }
    }

    fn bin_expr(
        &self,
        field: &str,
        span: &Span,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
    ) -> String {
        if field == "timestamp" || field == "received_at" {
            return self.time_bucket_col_expr(field, span.as_secs().max(1));
        }
        let base = self.field_expr(field, env, sink, true);
        let step = span.as_millis().max(1);
        match self.dialect {
            Dialect::Columnar => format!("floor({base} / {step}) * {step}"),
            Dialect::Relational => {
                format!("(CAST({base} / {step} AS INTEGER)) * {step}")
            }
        }
    }

    /// Bucket `timestamp` to the span: floor(ts / span) * span.
    pub fn time_bucket_expr(&self, span_secs: u64) -> String {
        self.time_bucket_col_expr("timestamp", span_secs)
    }

    fn time_bucket_col_expr(&self, col: &str, span_secs: u64) -> String {
        match self.dialect {
            Dialect::Columnar => {
                format!("toStartOfInterval({col}, INTERVAL {span_secs} SECOND)")
            }
            Dialect::Relational => format!(
                "strftime('%Y-%m-%dT%H:%M:%SZ', \
                 (CAST(strftime('%s', {col}) AS INTEGER) / {span_secs}) * {span_secs}, 'unixepoch')"
            ),
        }
    }

    fn filter_to_sql(
        &self,
        expr: &FilterExpr,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
        warnings: &mut Vec<String>,
    ) -> Result<Option<String>, QueryError> {
        if matches!(expr, FilterExpr::MatchAll) {
            return Ok(None);
        }
        Ok(Some(self.filter_node(expr, env, sink, warnings)?))
    }

    fn filter_node(
        &self,
        expr: &FilterExpr,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
        warnings: &mut Vec<String>,
    ) -> Result<String, QueryError> {
        match expr {
            FilterExpr::And(a, b) => Ok(format!(
                "({} AND {})",
                self.filter_node(a, env, sink, warnings)?,
                self.filter_node(b, env, sink, warnings)?
            )),
            FilterExpr::Or(a, b) => Ok(format!(
                "({} OR {})",
                self.filter_node(a, env, sink, warnings)?,
                self.filter_node(b, env, sink, warnings)?
            )),
            FilterExpr::Not(e) => Ok(format!(
                "NOT ({})",
                self.filter_node(e, env, sink, warnings)?
            )),
            FilterExpr::MatchAll => Ok("1 = 1".to_string()),
            FilterExpr::Compare { field, op, value } => {
                self.compare_to_sql(field, *op, value, env, sink, warnings)
            }
        }
    }

    fn compare_to_sql(
        &self,
        field: &str,
        op: CmpOp,
        value: &Value,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
        warnings: &mut Vec<String>,
    ) -> Result<String, QueryError> {
        let kind = if env.contains_key(field) {
            ColumnKind::Structured
        } else {
            column_kind(field)
        };

        if op == CmpOp::Match {
            let expr = self.field_expr(field, env, sink, false);
            let pattern = match value {
                Value::Str(s) => s.clone(),
                Value::Int(i) => i.to_string(),
                Value::Float(x) => x.to_string(),
            };
            // `~` is case-insensitive; fall back to substring when the
            // pattern is not a valid regex.
            return Ok(match regex::Regex::new(&pattern) {
                Ok(_) => {
                    let ph = sink.push(SqlParam::String(format!("(?i){pattern}")));
                    match self.dialect {
                        Dialect::Columnar => format!("match(toString({expr}), {ph})"),
                        Dialect::Relational => format!("{expr} REGEXP {ph}"),
                    }
                }
                Err(_) => {
                    let ph = sink.push(SqlParam::String(pattern));
                    match self.dialect {
                        Dialect::Columnar => {
                            format!("positionCaseInsensitive(toString({expr}), {ph}) > 0")
                        }
                        Dialect::Relational => format!("instr(lower({expr}), lower({ph})) > 0"),
                    }
                }
            });
        }

        let sql_op = match op {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Match => unreachable!(),
        };

        match kind {
            ColumnKind::Numeric => match value {
                Value::Int(i) if *i >= 0 && *i <= u32::MAX as i64 => {
                    let ph = sink.push(SqlParam::UInt32(*i as u32));
                    Ok(format!("{field} {sql_op} {ph}"))
                }
                Value::Int(i) => {
                    let ph = sink.push(SqlParam::Int32((*i).clamp(i32::MIN as i64, i32::MAX as i64) as i32));
                    Ok(format!("{field} {sql_op} {ph}"))
                }
                Value::Float(x) => {
                    let ph = sink.push(SqlParam::Float64(*x));
                    Ok(format!("{field} {sql_op} {ph}"))
                }
                Value::Str(s) => {
                    warnings.push(format!(
                        "type mismatch: numeric field '{field}' compared to \"{s}\"; \
                         comparison yields false"
                    ));
                    Ok("1 = 0".to_string())
                }
            },
            ColumnKind::Timestamp => {
                let instant = match value {
                    Value::Str(s) => parse_instant(s, chrono::Utc::now()).ok(),
                    _ => None,
                };
                match instant {
                    Some(t) => {
                        let ph = sink.push(SqlParam::DateTime(t));
                        Ok(format!("{field} {sql_op} {ph}"))
                    }
                    None => {
                        warnings.push(format!(
                            "type mismatch: time field '{field}' compared to a non-time value; \
                             comparison yields false"
                        ));
                        Ok("1 = 0".to_string())
                    }
                }
            }
            ColumnKind::Ip => {
                let text = match value {
                    Value::Str(s) => s.clone(),
                    Value::Int(i) => i.to_string(),
                    Value::Float(x) => x.to_string(),
                };
                let ph = sink.push(SqlParam::String(text));
                match self.dialect {
                    Dialect::Columnar => Ok(format!("{field} {sql_op} toIPv6({ph})")),
                    Dialect::Relational => Ok(format!("{field} {sql_op} {ph}")),
                }
            }
            ColumnKind::Text => {
                let text = match value {
                    Value::Str(s) => s.clone(),
                    Value::Int(i) => i.to_string(),
                    Value::Float(x) => x.to_string(),
                };
                let ph = sink.push(SqlParam::String(text));
                Ok(format!("{field} {sql_op} {ph}"))
            }
            ColumnKind::Structured => match value {
                Value::Int(_) | Value::Float(_) => {
                    let expr = self.field_expr(field, env, sink, true);
                    let x = match value {
                        Value::Int(i) => *i as f64,
                        Value::Float(x) => *x,
                        _ => unreachable!(),
                    };
                    let ph = sink.push(SqlParam::Float64(x));
                    Ok(format!("{expr} {sql_op} {ph}"))
                }
                Value::Str(s) => {
                    let expr = self.field_expr(field, env, sink, false);
                    let ph = sink.push(SqlParam::String(s.clone()));
                    Ok(format!("{expr} {sql_op} {ph}"))
                }
            },
        }
    }

    fn expr_to_sql(
        &self,
        expr: &Expr,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
    ) -> Result<String, QueryError> {
        self.expr_to_sql_ctx(expr, env, sink, false)
    }

    /// `numeric` propagates arithmetic context so structured fields get a
    /// numeric coercion where the dialect needs one.
    fn expr_to_sql_ctx(
        &self,
        expr: &Expr,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
        numeric: bool,
    ) -> Result<String, QueryError> {
        match expr {
            Expr::Num(x) => Ok(sink.push(SqlParam::Float64(*x))),
            Expr::Str(s) => Ok(sink.push(SqlParam::String(s.clone()))),
            Expr::Field(name) => Ok(self.field_expr(name, env, sink, numeric)),
            Expr::Neg(e) => Ok(format!("(-{})", self.expr_to_sql_ctx(e, env, sink, true)?)),
            Expr::Binary { op, lhs, rhs } => {
                let operand_numeric = matches!(
                    op,
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod
                );
                let l = self.expr_to_sql_ctx(lhs, env, sink, operand_numeric)?;
                let r = self.expr_to_sql_ctx(rhs, env, sink, operand_numeric)?;
                Ok(match op {
                    BinOp::Div => match self.dialect {
                        // Null on division by zero, float semantics.
                        Dialect::Columnar => format!("({l} / nullIf({r}, 0))"),
                        Dialect::Relational => {
                            format!("(CAST({l} AS REAL) / NULLIF({r}, 0))")
                        }
                    },
                    BinOp::Mod => match self.dialect {
                        Dialect::Columnar => format!("modulo({l}, nullIf({r}, 0))"),
                        Dialect::Relational => format!("({l} % NULLIF({r}, 0))"),
                    },
                    BinOp::And => format!("({l} AND {r})"),
                    BinOp::Or => format!("({l} OR {r})"),
                    other => format!("({l} {} {r})", other.symbol()),
                })
            }
            Expr::Call { name, args } => {
                let arg_numeric =
                    matches!(name.as_str(), "abs" | "round" | "ceil" | "floor");
                let mut parts = Vec::with_capacity(args.len());
                for a in args {
                    parts.push(self.expr_to_sql_ctx(a, env, sink, arg_numeric)?);
                }
                Ok(match (name.as_str(), self.dialect) {
                    ("if", Dialect::Columnar) => {
                        format!("if({}, {}, {})", parts[0], parts[1], parts[2])
                    }
                    ("if", Dialect::Relational) => format!(
                        "CASE WHEN {} THEN {} ELSE {} END",
                        parts[0], parts[1], parts[2]
                    ),
                    ("coalesce", _) => format!("COALESCE({})", parts.join(", ")),
                    ("concat", Dialect::Columnar) => {
                        let cast: Vec<String> =
                            parts.iter().map(|p| format!("toString({p})")).collect();
                        format!("concat({})", cast.join(", "))
                    }
                    ("concat", Dialect::Relational) => {
                        let cast: Vec<String> =
                            parts.iter().map(|p| format!("CAST({p} AS TEXT)")).collect();
                        cast.join(" || ")
                    }
                    ("lower" | "upper" | "abs" | "round" | "ceil" | "floor", _) => {
                        format!("{name}({})", parts.join(", "))
                    }
                    (other, _) => {
                        return Err(QueryError::Plan(format!(
                            "function '{other}' cannot be lowered to SQL"
                        )))
                    }
                })
            }
        }
    }

    /// SQL for one aggregation call. Returns the select expression and, for
    /// relational array-lane functions, the finisher the post-processor runs.
    fn agg_expr(
        &self,
        agg: &AggCall,
        env: &HashMap<String, String>,
        sink: &mut ParamSink,
    ) -> (String, Option<AggFunc>) {
        let numeric = matches!(
            agg.func,
            AggFunc::Sum
                | AggFunc::Avg
                | AggFunc::Stddev
                | AggFunc::Variance
                | AggFunc::Range
                | AggFunc::Median
                | AggFunc::Percentile(_)
        );
        let arg = agg
            .field
            .as_deref()
            .map(|f| self.field_expr(f, env, sink, numeric && !is_event_column(f)));

        match self.dialect {
            Dialect::Columnar => {
                let a = arg.as_deref().unwrap_or("");
                let expr = match agg.func {
                    AggFunc::Count => "count()".to_string(),
                    AggFunc::Sum => format!("sum({a})"),
                    AggFunc::Avg => format!("avg({a})"),
                    AggFunc::Min => format!("min({a})"),
                    AggFunc::Max => format!("max({a})"),
                    AggFunc::Dc => format!("uniqExact({a})"),
                    AggFunc::Values => format!("groupUniqArray({a})"),
                    AggFunc::List => format!("groupArray({a})"),
                    AggFunc::Earliest => format!("argMin({a}, timestamp)"),
                    AggFunc::Latest => format!("argMax({a}, timestamp)"),
                    AggFunc::First => format!("any({a})"),
                    AggFunc::Last => format!("anyLast({a})"),
                    AggFunc::Median => format!("quantile(0.5)({a})"),
                    AggFunc::Percentile(p) => format!("quantile(0.{p:02})({a})"),
                    AggFunc::Mode => format!("arrayElement(topK(1)({a}), 1)"),
                    AggFunc::Stddev => format!("stddevPop({a})"),
                    AggFunc::Variance => format!("varPop({a})"),
                    AggFunc::Range => format!("max({a}) - min({a})"),
                };
                (expr, None)
            }
            Dialect::Relational => {
                let a = arg.as_deref().unwrap_or("");
                match agg.func {
                    AggFunc::Count => ("COUNT(*)".to_string(), None),
                    AggFunc::Sum => (format!("SUM({a})"), None),
                    AggFunc::Avg => (format!("AVG({a})"), None),
                    AggFunc::Min => (format!("MIN({a})"), None),
                    AggFunc::Max => (format!("MAX({a})"), None),
                    AggFunc::Dc => (format!("COUNT(DISTINCT {a})"), None),
                    AggFunc::Range => (format!("MAX({a}) - MIN({a})"), None),
                    AggFunc::Variance => {
                        (format!("AVG({a} * {a}) - AVG({a}) * AVG({a})"), None)
                    }
                    AggFunc::Stddev => {
                        (format!("sqrt(AVG({a} * {a}) - AVG({a}) * AVG({a}))"), None)
                    }
                    AggFunc::Values => {
                        (format!("json_group_array(DISTINCT {a})"), Some(AggFunc::Values))
                    }
                    AggFunc::List => (format!("json_group_array({a})"), Some(AggFunc::List)),
                    AggFunc::Earliest => (
                        format!("json_group_array({a} ORDER BY timestamp)"),
                        Some(AggFunc::Earliest),
                    ),
                    AggFunc::Latest => (
                        format!("json_group_array({a} ORDER BY timestamp)"),
                        Some(AggFunc::Latest),
                    ),
                    AggFunc::First => (format!("json_group_array({a})"), Some(AggFunc::First)),
                    AggFunc::Last => (format!("json_group_array({a})"), Some(AggFunc::Last)),
                    AggFunc::Median => (format!("json_group_array({a})"), Some(AggFunc::Median)),
                    AggFunc::Mode => (format!("json_group_array({a})"), Some(AggFunc::Mode)),
                    AggFunc::Percentile(p) => (
                        format!("json_group_array({a})"),
                        Some(AggFunc::Percentile(p)),
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parser::parse;
    use chrono::{TimeZone, Utc};

    fn range() -> TimeRange {
        TimeRange {
            earliest: Utc.with_ymd_and_hms(2023, 10, 10, 0, 0, 0).unwrap(),
            latest: Utc.with_ymd_and_hms(2023, 10, 11, 0, 0, 0).unwrap(),
        }
    }

    fn plan_q(dialect: Dialect, q: &str) -> Plan {
        let pipeline = parse(q).unwrap();
        Planner::new(dialect)
            .plan(&pipeline, range(), None)
            .unwrap()
    }

    #[test]
    fn filter_then_count_lowers_to_group_free_select() {
        let plan = plan_q(
            Dialect::Columnar,
            "search host=web-01 severity<=3 | stats count",
        );
        assert!(plan.sql.contains("count() AS \"count\""), "{}", plan.sql);
        assert!(plan.sql.contains("hostname = {p2:String}"), "{}", plan.sql);
        assert!(plan.sql.contains("severity <= {p3:UInt32}"), "{}", plan.sql);
        assert_eq!(plan.params[2], SqlParam::String("web-01".to_string()));
        assert_eq!(plan.params[3], SqlParam::UInt32(3));
    }

    #[test]
    fn relational_uses_numbered_placeholders() {
        let plan = plan_q(
            Dialect::Relational,
            "search host=web-01 | stats count by hostname",
        );
        assert!(plan.sql.contains("hostname = ?3"), "{}", plan.sql);
        assert!(plan.sql.contains("GROUP BY \"hostname\""), "{}", plan.sql);
        assert!(plan.sql.contains("COUNT(*) AS \"count\""), "{}", plan.sql);
    }

    #[test]
    fn timechart_groups_by_bucket() {
        let plan = plan_q(Dialect::Columnar, "search * | timechart span=1h count");
        assert!(
            plan.sql
                .contains("toStartOfInterval(timestamp, INTERVAL 3600 SECOND)"),
            "{}",
            plan.sql
        );
        assert!(
            plan.post_ops
                .iter()
                .any(|op| matches!(op, PostOp::TimechartFill { .. })),
            "gap filling must run client-side"
        );

        let plan = plan_q(Dialect::Relational, "search * | timechart span=1h count");
        assert!(plan.sql.contains("strftime"), "{}", plan.sql);
    }

    #[test]
    fn top_is_stats_sort_limit() {
        let top = plan_q(Dialect::Columnar, "search * | top 5 hostname");
        let spelled = plan_q(
            Dialect::Columnar,
            "search * | stats count by hostname | sort desc count | limit 5",
        );
        assert_eq!(top.sql, spelled.sql);
        assert_eq!(top.params, spelled.params);
    }

    #[test]
    fn sort_limit_after_stats_lower_into_sql() {
        let plan = plan_q(
            Dialect::Columnar,
            "search * | stats count by hostname | sort desc count | limit 5",
        );
        assert!(plan.sql.contains("ORDER BY \"count\" DESC"), "{}", plan.sql);
        assert!(plan.post_ops.is_empty(), "{:?}", plan.post_ops);
        assert_eq!(plan.params.last(), Some(&SqlParam::UInt32(5)));
    }

    #[test]
    fn rex_before_stats_forces_client_side_aggregation() {
        let plan = plan_q(
            Dialect::Columnar,
            r#"search * | rex "(?P<code>\d+)" | stats count by code"#,
        );
        assert!(!plan.sql.contains("GROUP BY"), "{}", plan.sql);
        assert!(matches!(plan.post_ops[0], PostOp::Rex { .. }));
        assert!(plan
            .post_ops
            .iter()
            .any(|op| matches!(op, PostOp::Aggregate { .. })));
    }

    #[test]
    fn numeric_string_mismatch_warns_and_yields_false() {
        let plan = plan_q(Dialect::Columnar, "search severity=\"high\"");
        assert!(plan.sql.contains("1 = 0"), "{}", plan.sql);
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn unknown_field_becomes_structured_access() {
        let plan = plan_q(Dialect::Columnar, "search status=404");
        assert!(
            plan.sql.contains("toFloat64OrNull(structured_data[{p2:String}])"),
            "{}",
            plan.sql
        );
        let plan = plan_q(Dialect::Relational, "search status=404");
        assert!(
            plan.sql.contains("json_extract(structured_data, ?3)"),
            "{}",
            plan.sql
        );
    }

    #[test]
    fn relational_percentile_uses_array_lane() {
        let plan = plan_q(
            Dialect::Relational,
            "search * | stats p95(severity) by hostname",
        );
        assert!(plan.sql.contains("json_group_array"), "{}", plan.sql);
        match &plan.post_ops[0] {
            PostOp::FinishArrays(fins) => {
                assert_eq!(fins[0].source, "__arr_p95(severity)");
                assert_eq!(fins[0].target, "p95(severity)");
                assert_eq!(fins[0].func, AggFunc::Percentile(95));
            }
            other => panic!("expected FinishArrays, got {other:?}"),
        }
    }

    #[test]
    fn match_operator_is_case_insensitive_regex() {
        let plan = plan_q(Dialect::Columnar, "search message~\"time.?out\"");
        assert!(plan.sql.contains("match(toString(message)"), "{}", plan.sql);
        assert!(plan
            .params
            .iter()
            .any(|p| *p == SqlParam::String("(?i)time.?out".to_string())));
    }

    #[test]
    fn lowered_eval_joins_select_and_group_by() {
        let plan = plan_q(
            Dialect::Columnar,
            "search * | eval band = severity * 10 | stats count by band",
        );
        assert!(plan.sql.contains("GROUP BY \"band\""), "{}", plan.sql);
        assert!(!plan
            .post_ops
            .iter()
            .any(|op| matches!(op, PostOp::Eval(_))));
    }

    #[test]
    fn plain_search_selects_event_columns_with_cap() {
        let plan = plan_q(Dialect::Columnar, "search host=web-01");
        assert!(plan.sql.starts_with("SELECT timestamp, received_at,"));
        assert!(plan.sql.contains("ORDER BY timestamp DESC"));
        assert_eq!(
            plan.params.last(),
            Some(&SqlParam::UInt32(DEFAULT_PRE_AGG_CAP as u32))
        );
    }

    #[test]
    fn every_plan_passes_param_verification() {
        for dialect in [Dialect::Columnar, Dialect::Relational] {
            for q in [
                "search host=web-01 severity<=3 | stats count",
                "search * | timechart span=5m count, avg(severity) by app_name",
                "search status=404 | top 5 hostname",
                "search * | eval kb = bytes / 1024 | where kb > 10 | sort desc kb | head 3",
                "search * | dedup hostname",
                "search source_ip=10.0.0.1",
            ] {
                let plan = plan_q(dialect, q);
                crate::storage::verify_params(&plan.sql, &plan.params, dialect)
                    .unwrap_or_else(|e| panic!("{dialect:?} {q}: {e}\n{}", plan.sql));
            }
        }
    }
}

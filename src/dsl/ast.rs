use std::fmt;

/// A parsed query: an ordered pipeline of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

/// One piped command. The planner is a pure function of this tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Search(FilterExpr),
    Where(FilterExpr),
    Stats {
        aggs: Vec<AggCall>,
        by: Vec<String>,
    },
    Timechart {
        span: Span,
        aggs: Vec<AggCall>,
        by: Vec<String>,
    },
    Sort {
        keys: Vec<(String, SortDir)>,
    },
    Limit(u64),
    Head(u64),
    Tail(u64),
    Dedup(Vec<String>),
    Table(Vec<String>),
    Fields {
        exclude: bool,
        fields: Vec<String>,
    },
    Rename(Vec<(String, String)>),
    Eval(Vec<(String, Expr)>),
    Top {
        n: u64,
        field: String,
    },
    Rare {
        n: u64,
        field: String,
    },
    Bin {
        span: Span,
        field: String,
    },
    Rex {
        field: String,
        pattern: String,
    },
}

impl Stage {
    pub fn command_name(&self) -> &'static str {
        match self {
            Stage::Search(_) => "search",
            Stage::Where(_) => "where",
            Stage::Stats { .. } => "stats",
            Stage::Timechart { .. } => "timechart",
            Stage::Sort { .. } => "sort",
            Stage::Limit(_) => "limit",
            Stage::Head(_) => "head",
            Stage::Tail(_) => "tail",
            Stage::Dedup(_) => "dedup",
            Stage::Table(_) => "table",
            Stage::Fields { .. } => "fields",
            Stage::Rename(_) => "rename",
            Stage::Eval(_) => "eval",
            Stage::Top { .. } => "top",
            Stage::Rare { .. } => "rare",
            Stage::Bin { .. } => "bin",
            Stage::Rex { .. } => "rex",
        }
    }
}

/// Recursive boolean filter used by `search` and `where`.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Compare {
        field: String,
        op: CmpOp,
        value: Value,
    },
    MatchAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Case-insensitive regex match, substring when the pattern is invalid.
    Match,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Match => "~",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
}

/// One aggregation call inside `stats` or `timechart`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggCall {
    pub func: AggFunc,
    pub field: Option<String>,
    pub alias: Option<String>,
}

impl AggCall {
    /// Column name in the result set: the printed call unless aliased.
    pub fn output_name(&self) -> String {
        if let Some(a) = &self.alias {
            return a.clone();
        }
        match &self.field {
            Some(f) => format!("{}({})", self.func.name(), f),
            None => self.func.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Dc,
    Values,
    List,
    Earliest,
    Latest,
    First,
    Last,
    Median,
    Mode,
    Stddev,
    Variance,
    Range,
    Percentile(u8),
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Dc => "dc",
            AggFunc::Values => "values",
            AggFunc::List => "list",
            AggFunc::Earliest => "earliest",
            AggFunc::Latest => "latest",
            AggFunc::First => "first",
            AggFunc::Last => "last",
            AggFunc::Median => "median",
            AggFunc::Mode => "mode",
            AggFunc::Stddev => "stddev",
            AggFunc::Variance => "variance",
            AggFunc::Range => "range",
            AggFunc::Percentile(50) => "p50",
            AggFunc::Percentile(90) => "p90",
            AggFunc::Percentile(95) => "p95",
            AggFunc::Percentile(99) => "p99",
            AggFunc::Percentile(_) => "p",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "count" => AggFunc::Count,
            "sum" => AggFunc::Sum,
            "avg" => AggFunc::Avg,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            "dc" | "distinct_count" => AggFunc::Dc,
            "values" => AggFunc::Values,
            "list" => AggFunc::List,
            "earliest" => AggFunc::Earliest,
            "latest" => AggFunc::Latest,
            "first" => AggFunc::First,
            "last" => AggFunc::Last,
            "median" => AggFunc::Median,
            "mode" => AggFunc::Mode,
            "stddev" => AggFunc::Stddev,
            "variance" => AggFunc::Variance,
            "range" => AggFunc::Range,
            "p50" => AggFunc::Percentile(50),
            "p90" => AggFunc::Percentile(90),
            "p95" => AggFunc::Percentile(95),
            "p99" => AggFunc::Percentile(99),
            _ => return None,
        })
    }

    /// True when the call needs a field argument.
    pub fn requires_field(&self) -> bool {
        !matches!(self, AggFunc::Count)
    }

    /// Count-family aggregates zero-fill timechart gaps; everything else
    /// null-fills.
    pub fn zero_fills(&self) -> bool {
        matches!(self, AggFunc::Count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Millis,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl TimeUnit {
    pub fn suffix(&self) -> &'static str {
        match self {
            TimeUnit::Millis => "ms",
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "m",
            TimeUnit::Hours => "h",
            TimeUnit::Days => "d",
            TimeUnit::Weeks => "w",
        }
    }

    pub fn millis(&self) -> u64 {
        match self {
            TimeUnit::Millis => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
            TimeUnit::Weeks => 604_800_000,
        }
    }
}

/// A duration literal like `5m` or `1h`, unit preserved for printing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub value: u64,
    pub unit: TimeUnit,
}

impl Span {
    pub fn as_millis(&self) -> u64 {
        self.value * self.unit.millis()
    }

    pub fn as_secs(&self) -> u64 {
        self.as_millis() / 1000
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.suffix())
    }
}

/// Scalar expression used by `eval`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Field(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "=",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
        }
    }
}

// ── Printing ──
// The printed form must re-parse to an equivalent AST; every composite
// prints fully parenthesized to avoid precedence drift.

pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{}", quote_string(s)),
            Value::Int(i) => write!(f, "{i}"),
            // Keep the decimal point so a float re-parses as a float.
            Value::Float(x) if x.fract() == 0.0 => write!(f, "{x:.1}"),
            Value::Float(x) => write!(f, "{x}"),
        }
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::And(a, b) => write!(f, "({a} AND {b})"),
            FilterExpr::Or(a, b) => write!(f, "({a} OR {b})"),
            FilterExpr::Not(e) => write!(f, "NOT ({e})"),
            FilterExpr::Compare { field, op, value } => {
                write!(f, "{field} {} {value}", op.symbol())
            }
            FilterExpr::MatchAll => write!(f, "*"),
        }
    }
}

impl fmt::Display for AggCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}({field})", self.func.name())?,
            None => write!(f, "{}", self.func.name())?,
        }
        if let Some(a) = &self.alias {
            write!(f, " as {a}")?;
        }
        Ok(())
    }
}

fn fmt_num(x: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        write!(f, "{}", x as i64)
    } else {
        write!(f, "{x}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(x) => fmt_num(*x, f),
            Expr::Str(s) => write!(f, "{}", quote_string(s)),
            Expr::Field(name) => write!(f, "{name}"),
            Expr::Neg(e) => write!(f, "(-{e})"),
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn fmt_fields(fields: &[String]) -> String {
    fields.join(", ")
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Search(e) => write!(f, "search {e}"),
            Stage::Where(e) => write!(f, "where {e}"),
            Stage::Stats { aggs, by } => {
                write!(f, "stats ")?;
                for (i, a) in aggs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                if !by.is_empty() {
                    write!(f, " by {}", fmt_fields(by))?;
                }
                Ok(())
            }
            Stage::Timechart { span, aggs, by } => {
                write!(f, "timechart span={span} ")?;
                for (i, a) in aggs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                if !by.is_empty() {
                    write!(f, " by {}", fmt_fields(by))?;
                }
                Ok(())
            }
            Stage::Sort { keys } => {
                write!(f, "sort ")?;
                for (i, (field, dir)) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    let d = match dir {
                        SortDir::Asc => "asc",
                        SortDir::Desc => "desc",
                    };
                    write!(f, "{d} {field}")?;
                }
                Ok(())
            }
            Stage::Limit(n) => write!(f, "limit {n}"),
            Stage::Head(n) => write!(f, "head {n}"),
            Stage::Tail(n) => write!(f, "tail {n}"),
            Stage::Dedup(fields) => write!(f, "dedup {}", fmt_fields(fields)),
            Stage::Table(fields) => write!(f, "table {}", fmt_fields(fields)),
            Stage::Fields { exclude, fields } => {
                if *exclude {
                    write!(f, "fields - {}", fmt_fields(fields))
                } else {
                    write!(f, "fields {}", fmt_fields(fields))
                }
            }
            Stage::Rename(pairs) => {
                write!(f, "rename ")?;
                for (i, (from, to)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{from} as {to}")?;
                }
                Ok(())
            }
            Stage::Eval(assignments) => {
                write!(f, "eval ")?;
                for (i, (name, expr)) in assignments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name} = {expr}")?;
                }
                Ok(())
            }
            Stage::Top { n, field } => write!(f, "top {n} {field}"),
            Stage::Rare { n, field } => write!(f, "rare {n} {field}"),
            Stage::Bin { span, field } => write!(f, "bin span={span} {field}"),
            Stage::Rex { field, pattern } => {
                write!(f, "rex field={field} {}", quote_string(pattern))
            }
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}

use crate::dsl::ast::*;
use crate::dsl::lexer::{lex, Tok, Token};
use crate::error::QueryError;

/// Queries longer than this are rejected before lexing.
pub const MAX_QUERY_BYTES: usize = 50 * 1024;

/// User-facing shorthand -> canonical column names, applied while parsing so
/// every later phase sees canonical fields only.
pub const FIELD_ALIASES: &[(&str, &str)] = &[
    ("host", "hostname"),
    ("source", "hostname"),
    ("app", "app_name"),
    ("program", "app_name"),
    ("sourcetype", "app_name"),
    ("level", "severity"),
    ("msg", "message"),
    ("_raw", "raw"),
    ("_time", "timestamp"),
    ("time", "timestamp"),
    ("index", "index_name"),
];

pub fn resolve_alias(name: &str) -> String {
    for (alias, canonical) in FIELD_ALIASES {
        if *alias == name {
            return (*canonical).to_string();
        }
    }
    name.to_string()
}

const COMMANDS: &[&str] = &[
    "search", "where", "stats", "timechart", "sort", "limit", "head", "tail", "dedup", "table",
    "fields", "rename", "eval", "top", "rare", "bin", "rex",
];

pub fn parse(input: &str) -> Result<Pipeline, QueryError> {
    if input.len() > MAX_QUERY_BYTES {
        return Err(QueryError::parse(
            format!("query exceeds {MAX_QUERY_BYTES} bytes"),
            1,
            1,
        ));
    }
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(QueryError::parse("empty query", 1, 1));
    }
    Parser::new(tokens).parse_pipeline()
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(toks: Vec<Token>) -> Self {
        Self { toks, pos: 0 }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn peek2(&self) -> Option<&Tok> {
        self.toks.get(self.pos + 1).map(|t| &t.tok)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn here(&self) -> (usize, usize) {
        match self.toks.get(self.pos).or_else(|| self.toks.last()) {
            Some(t) => (t.line, t.column),
            None => (1, 1),
        }
    }

    fn err(&self, message: impl Into<String>) -> QueryError {
        let (line, column) = self.here();
        QueryError::parse(message, line, column)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), QueryError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            let found = self
                .peek()
                .map(|t| t.describe())
                .unwrap_or_else(|| "end of query".to_string());
            Err(self.err(format!("expected {}, found {found}", tok.describe())))
        }
    }

    fn at_stage_end(&self) -> bool {
        matches!(self.peek(), None | Some(Tok::Pipe))
    }

    /// Consume a bareword. Keywords are not filtered here; callers decide.
    fn word(&mut self, what: &str) -> Result<String, QueryError> {
        match self.peek() {
            Some(Tok::Word(_)) => {
                let Some(Token {
                    tok: Tok::Word(w), ..
                }) = self.next()
                else {
                    unreachable!()
                };
                Ok(w)
            }
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of query".to_string());
                Err(self.err(format!("expected {what}, found {found}")))
            }
        }
    }

    fn field(&mut self) -> Result<String, QueryError> {
        let w = self.word("field name")?;
        Ok(resolve_alias(&w))
    }

    fn uint(&mut self, what: &str) -> Result<u64, QueryError> {
        match self.peek() {
            Some(Tok::Int(i)) if *i >= 0 => {
                let Some(Token { tok: Tok::Int(i), .. }) = self.next() else {
                    unreachable!()
                };
                Ok(i as u64)
            }
            Some(Tok::Int(_)) => Err(self.err(format!("{what} must be non-negative"))),
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of query".to_string());
                Err(self.err(format!("expected {what}, found {found}")))
            }
        }
    }

    // ── Pipeline ──

    fn parse_pipeline(&mut self) -> Result<Pipeline, QueryError> {
        let mut stages = Vec::new();
        loop {
            let stage = self.parse_stage(stages.is_empty())?;
            stages.push(stage);
            if self.peek().is_none() {
                break;
            }
            self.expect(Tok::Pipe)?;
            if self.peek().is_none() {
                return Err(self.err("expected a command after '|'"));
            }
        }
        Ok(Pipeline { stages })
    }

    fn parse_stage(&mut self, first: bool) -> Result<Stage, QueryError> {
        let command = match self.peek() {
            Some(Tok::Word(w)) if COMMANDS.contains(&w.as_str()) => w.clone(),
            _ if first => {
                // Leading `search` is implicit when the pipeline does not
                // start with a known command.
                return Ok(Stage::Search(self.parse_filter_expr()?));
            }
            Some(Tok::Word(w)) => {
                let w = w.clone();
                return Err(self.err(format!("unknown command '{w}'")));
            }
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of query".to_string());
                return Err(self.err(format!("expected a command, found {found}")));
            }
        };
        self.next();

        match command.as_str() {
            "search" => Ok(Stage::Search(self.parse_filter_expr()?)),
            "where" => {
                if self.at_stage_end() {
                    return Err(self.err("where requires an expression"));
                }
                Ok(Stage::Where(self.parse_filter_expr()?))
            }
            "stats" => self.parse_stats(),
            "timechart" => self.parse_timechart(),
            "sort" => self.parse_sort(),
            "limit" => Ok(Stage::Limit(self.uint("limit")?)),
            "head" => Ok(Stage::Head(self.uint("head")?)),
            "tail" => Ok(Stage::Tail(self.uint("tail")?)),
            "dedup" => Ok(Stage::Dedup(self.parse_field_list("dedup")?)),
            "table" => Ok(Stage::Table(self.parse_field_list("table")?)),
            "fields" => self.parse_fields(),
            "rename" => self.parse_rename(),
            "eval" => self.parse_eval(),
            "top" => self.parse_top_rare(true),
            "rare" => self.parse_top_rare(false),
            "bin" => self.parse_bin(),
            "rex" => self.parse_rex(),
            other => Err(self.err(format!("unknown command '{other}'"))),
        }
    }

    // ── Filters ──

    fn parse_filter_expr(&mut self) -> Result<FilterExpr, QueryError> {
        if self.at_stage_end() {
            return Ok(FilterExpr::MatchAll);
        }
        self.parse_filter_or()
    }

    fn parse_filter_or(&mut self) -> Result<FilterExpr, QueryError> {
        let mut lhs = self.parse_filter_and()?;
        while let Some(Tok::Word(w)) = self.peek() {
            if !w.eq_ignore_ascii_case("or") {
                break;
            }
            self.next();
            let rhs = self.parse_filter_and()?;
            lhs = FilterExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_filter_and(&mut self) -> Result<FilterExpr, QueryError> {
        let mut lhs = self.parse_filter_unary()?;
        loop {
            match self.peek() {
                Some(Tok::Word(w)) if w.eq_ignore_ascii_case("and") => {
                    self.next();
                }
                // Juxtaposed terms are an implicit AND: `host=a severity<=3`.
                Some(Tok::Word(w)) if !w.eq_ignore_ascii_case("or") => {}
                Some(Tok::LParen) | Some(Tok::Star) | Some(Tok::Str(_)) => {}
                _ => break,
            }
            let rhs = self.parse_filter_unary()?;
            lhs = FilterExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_filter_unary(&mut self) -> Result<FilterExpr, QueryError> {
        if let Some(Tok::Word(w)) = self.peek() {
            if w.eq_ignore_ascii_case("not") {
                self.next();
                let inner = self.parse_filter_unary()?;
                return Ok(FilterExpr::Not(Box::new(inner)));
            }
        }
        self.parse_filter_primary()
    }

    fn parse_filter_primary(&mut self) -> Result<FilterExpr, QueryError> {
        match self.peek() {
            Some(Tok::LParen) => {
                self.next();
                let inner = self.parse_filter_or()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Star) => {
                self.next();
                Ok(FilterExpr::MatchAll)
            }
            Some(Tok::Str(_)) => {
                // A bare quoted string is a free-text match on the message.
                let Some(Token { tok: Tok::Str(s), .. }) = self.next() else {
                    unreachable!()
                };
                Ok(FilterExpr::Compare {
                    field: "message".to_string(),
                    op: CmpOp::Match,
                    value: Value::Str(s),
                })
            }
            Some(Tok::Word(_)) => {
                let field = self.word("field name")?;
                let op = match self.peek() {
                    Some(Tok::Eq) => Some(CmpOp::Eq),
                    Some(Tok::Ne) => Some(CmpOp::Ne),
                    Some(Tok::Lt) => Some(CmpOp::Lt),
                    Some(Tok::Le) => Some(CmpOp::Le),
                    Some(Tok::Gt) => Some(CmpOp::Gt),
                    Some(Tok::Ge) => Some(CmpOp::Ge),
                    Some(Tok::Tilde) => Some(CmpOp::Match),
                    _ => None,
                };
                match op {
                    Some(op) => {
                        self.next();
                        let value = self.parse_value()?;
                        Ok(FilterExpr::Compare {
                            field: resolve_alias(&field),
                            op,
                            value,
                        })
                    }
                    // A lone bareword is a free-text match on the message.
                    None => Ok(FilterExpr::Compare {
                        field: "message".to_string(),
                        op: CmpOp::Match,
                        value: Value::Str(field),
                    }),
                }
            }
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of query".to_string());
                Err(self.err(format!("expected a filter term, found {found}")))
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, QueryError> {
        match self.next() {
            Some(Token { tok: Tok::Str(s), .. }) => Ok(Value::Str(s)),
            Some(Token { tok: Tok::Int(i), .. }) => Ok(Value::Int(i)),
            Some(Token {
                tok: Tok::Float(x), ..
            }) => Ok(Value::Float(x)),
            Some(Token { tok: Tok::Word(w), .. }) => Ok(Value::Str(w)),
            other => {
                let found = other
                    .map(|t| t.tok.describe())
                    .unwrap_or_else(|| "end of query".to_string());
                Err(self.err(format!("expected a value, found {found}")))
            }
        }
    }

    // ── Aggregating stages ──

    fn parse_agg_list(&mut self) -> Result<(Vec<AggCall>, Vec<String>), QueryError> {
        let mut aggs = Vec::new();
        let mut by = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::Word(w)) if w == "by" => {
                    self.next();
                    by = self.parse_field_list("by")?;
                    break;
                }
                Some(Tok::Word(_)) => {
                    aggs.push(self.parse_agg_call()?);
                    self.eat(&Tok::Comma);
                }
                None | Some(Tok::Pipe) => break,
                other => {
                    let found = other
                        .map(|t| t.describe())
                        .unwrap_or_else(|| "end of query".to_string());
                    return Err(self.err(format!(
                        "expected an aggregation or 'by', found {found}"
                    )));
                }
            }
        }
        Ok((aggs, by))
    }

    fn parse_agg_call(&mut self) -> Result<AggCall, QueryError> {
        let name = self.word("aggregation function")?;
        let func = AggFunc::from_name(&name)
            .ok_or_else(|| self.err(format!("unknown aggregation function '{name}'")))?;
        let mut field = None;
        if self.eat(&Tok::LParen) {
            // `count()` and `count` are the same call.
            if !self.eat(&Tok::RParen) {
                field = Some(self.field()?);
                self.expect(Tok::RParen)?;
            }
        }
        let mut alias = None;
        if let Some(Tok::Word(w)) = self.peek() {
            if w == "as" {
                self.next();
                alias = Some(self.word("alias")?);
            }
        }
        Ok(AggCall { func, field, alias })
    }

    fn parse_stats(&mut self) -> Result<Stage, QueryError> {
        let (aggs, by) = self.parse_agg_list()?;
        if aggs.is_empty() {
            return Err(self.err("stats requires at least one aggregation"));
        }
        Ok(Stage::Stats { aggs, by })
    }

    fn parse_timechart(&mut self) -> Result<Stage, QueryError> {
        let mut span = Span {
            value: 1,
            unit: TimeUnit::Minutes,
        };
        if let Some(Tok::Word(w)) = self.peek() {
            if w == "span" {
                self.next();
                self.expect(Tok::Eq)?;
                span = self.parse_span()?;
            }
        }
        let (aggs, by) = self.parse_agg_list()?;
        if aggs.is_empty() {
            return Err(self.err("timechart requires at least one aggregation"));
        }
        Ok(Stage::Timechart { span, aggs, by })
    }

    fn parse_span(&mut self) -> Result<Span, QueryError> {
        match self.peek().cloned() {
            Some(Tok::Word(w)) => {
                let span = parse_span_literal(&w)
                    .ok_or_else(|| self.err(format!("invalid span '{w}'")))?;
                self.next();
                Ok(span)
            }
            // `span=30` with no unit means seconds? No — require a unit.
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of query".to_string());
                Err(self.err(format!("expected a span like 1h, found {found}")))
            }
        }
    }

    // ── Row-shaping stages ──

    fn parse_sort(&mut self) -> Result<Stage, QueryError> {
        let mut keys = Vec::new();
        loop {
            let mut dir = SortDir::Asc;
            match self.peek() {
                Some(Tok::Minus) => {
                    self.next();
                    dir = SortDir::Desc;
                }
                Some(Tok::Plus) => {
                    self.next();
                }
                Some(Tok::Word(w)) if w == "desc" => {
                    self.next();
                    dir = SortDir::Desc;
                }
                Some(Tok::Word(w)) if w == "asc" => {
                    self.next();
                }
                _ => {}
            }
            let key = self.parse_sort_key()?;
            keys.push((key, dir));
            if !self.eat(&Tok::Comma) && self.at_stage_end() {
                break;
            }
            if self.at_stage_end() {
                break;
            }
        }
        if keys.is_empty() {
            return Err(self.err("sort requires at least one key"));
        }
        Ok(Stage::Sort { keys })
    }

    /// A sort key is a field name or an aggregate column like `avg(severity)`.
    fn parse_sort_key(&mut self) -> Result<String, QueryError> {
        let word = self.word("sort key")?;
        if self.peek() == Some(&Tok::LParen) && AggFunc::from_name(&word).is_some() {
            self.next();
            if self.eat(&Tok::RParen) {
                return Ok(word);
            }
            let inner = self.field()?;
            self.expect(Tok::RParen)?;
            return Ok(format!("{word}({inner})"));
        }
        Ok(resolve_alias(&word))
    }

    fn parse_field_list(&mut self, what: &str) -> Result<Vec<String>, QueryError> {
        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::Word(_)) => {
                    fields.push(self.field()?);
                    self.eat(&Tok::Comma);
                }
                _ => break,
            }
        }
        if fields.is_empty() {
            return Err(self.err(format!("{what} requires at least one field")));
        }
        Ok(fields)
    }

    fn parse_fields(&mut self) -> Result<Stage, QueryError> {
        let exclude = if self.eat(&Tok::Minus) {
            true
        } else {
            self.eat(&Tok::Plus);
            false
        };
        let fields = self.parse_field_list("fields")?;
        Ok(Stage::Fields { exclude, fields })
    }

    fn parse_rename(&mut self) -> Result<Stage, QueryError> {
        let mut pairs = Vec::new();
        loop {
            let from = self.field()?;
            let kw = self.word("'as'")?;
            if kw != "as" {
                return Err(self.err(format!("expected 'as' in rename, found '{kw}'")));
            }
            let to = self.word("new field name")?;
            pairs.push((from, to));
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok(Stage::Rename(pairs))
    }

    fn parse_eval(&mut self) -> Result<Stage, QueryError> {
        let mut assignments = Vec::new();
        loop {
            let name = self.word("field name")?;
            self.expect(Tok::Eq)?;
            let expr = self.parse_expr()?;
            assignments.push((name, expr));
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok(Stage::Eval(assignments))
    }

    fn parse_top_rare(&mut self, top: bool) -> Result<Stage, QueryError> {
        let n = match self.peek() {
            Some(Tok::Int(_)) => self.uint("count")?,
            _ => 10,
        };
        let field = self.field()?;
        Ok(if top {
            Stage::Top { n, field }
        } else {
            Stage::Rare { n, field }
        })
    }

    fn parse_bin(&mut self) -> Result<Stage, QueryError> {
        let kw = self.word("'span'")?;
        if kw != "span" {
            return Err(self.err(format!("expected 'span=' in bin, found '{kw}'")));
        }
        self.expect(Tok::Eq)?;
        let span = self.parse_span()?;
        let field = self.field()?;
        Ok(Stage::Bin { span, field })
    }

    fn parse_rex(&mut self) -> Result<Stage, QueryError> {
        let mut field = "message".to_string();
        if let Some(Tok::Word(w)) = self.peek() {
            if w == "field" && self.peek2() == Some(&Tok::Eq) {
                self.next();
                self.next();
                field = self.field()?;
            }
        }
        match self.next() {
            Some(Token { tok: Tok::Str(pattern), .. }) => Ok(Stage::Rex { field, pattern }),
            other => {
                let found = other
                    .map(|t| t.tok.describe())
                    .unwrap_or_else(|| "end of query".to_string());
                Err(self.err(format!("expected a quoted regex, found {found}")))
            }
        }
    }

    // ── Eval expressions (precedence climbing) ──

    fn parse_expr(&mut self) -> Result<Expr, QueryError> {
        self.parse_expr_or()
    }

    fn parse_expr_or(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_expr_and()?;
        while let Some(Tok::Word(w)) = self.peek() {
            if !w.eq_ignore_ascii_case("or") {
                break;
            }
            self.next();
            let rhs = self.parse_expr_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_expr_and(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_expr_cmp()?;
        while let Some(Tok::Word(w)) = self.peek() {
            if !w.eq_ignore_ascii_case("and") {
                break;
            }
            self.next();
            let rhs = self.parse_expr_cmp()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_expr_cmp(&mut self) -> Result<Expr, QueryError> {
        let lhs = self.parse_expr_add()?;
        let op = match self.peek() {
            Some(Tok::Eq) => Some(BinOp::Eq),
            Some(Tok::Ne) => Some(BinOp::Ne),
            Some(Tok::Lt) => Some(BinOp::Lt),
            Some(Tok::Le) => Some(BinOp::Le),
            Some(Tok::Gt) => Some(BinOp::Gt),
            Some(Tok::Ge) => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let rhs = self.parse_expr_add()?;
            return Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_expr_add(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_expr_mul()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_expr_mul()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_expr_mul(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.parse_expr_unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Mod,
                _ => break,
            };
            self.next();
            let rhs = self.parse_expr_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_expr_unary(&mut self) -> Result<Expr, QueryError> {
        if self.eat(&Tok::Minus) {
            let inner = self.parse_expr_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_expr_primary()
    }

    fn parse_expr_primary(&mut self) -> Result<Expr, QueryError> {
        match self.peek().cloned() {
            Some(Tok::Int(i)) => {
                self.next();
                Ok(Expr::Num(i as f64))
            }
            Some(Tok::Float(x)) => {
                self.next();
                Ok(Expr::Num(x))
            }
            Some(Tok::Str(s)) => {
                self.next();
                Ok(Expr::Str(s))
            }
            Some(Tok::LParen) => {
                self.next();
                let inner = self.parse_expr()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Word(w)) => {
                self.next();
                if self.eat(&Tok::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Tok::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&Tok::Comma) {
                                break;
                            }
                        }
                        self.expect(Tok::RParen)?;
                    }
                    Ok(Expr::Call { name: w, args })
                } else {
                    Ok(Expr::Field(resolve_alias(&w)))
                }
            }
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of query".to_string());
                Err(self.err(format!("expected an expression, found {found}")))
            }
        }
    }
}

/// `^\d+(ms|s|m|h|d|w)$`
pub fn parse_span_literal(s: &str) -> Option<Span> {
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    let unit = match unit {
        "ms" => TimeUnit::Millis,
        "s" => TimeUnit::Seconds,
        "m" => TimeUnit::Minutes,
        "h" => TimeUnit::Hours,
        "d" => TimeUnit::Days,
        "w" => TimeUnit::Weeks,
        _ => return None,
    };
    Some(Span { value, unit })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(q: &str) -> Pipeline {
        parse(q).unwrap_or_else(|e| panic!("parse failed for {q:?}: {e}"))
    }

    #[test]
    fn five_stage_pipeline() {
        let p = parse_ok("search | where severity<=3 | stats count by hostname | sort desc count | limit 5");
        assert_eq!(p.stages.len(), 5);
        assert_eq!(p.stages[0], Stage::Search(FilterExpr::MatchAll));
        match &p.stages[3] {
            Stage::Sort { keys } => {
                assert_eq!(keys.len(), 1);
                assert_eq!(keys[0], ("count".to_string(), SortDir::Desc));
            }
            other => panic!("expected sort, got {other:?}"),
        }
        assert_eq!(p.stages[4], Stage::Limit(5));
    }

    #[test]
    fn implicit_search_and_aliases() {
        let p = parse_ok("host=web-01 level<=3");
        let Stage::Search(expr) = &p.stages[0] else {
            panic!("expected implicit search");
        };
        match expr {
            FilterExpr::And(a, b) => {
                assert_eq!(
                    **a,
                    FilterExpr::Compare {
                        field: "hostname".to_string(),
                        op: CmpOp::Eq,
                        value: Value::Str("web-01".to_string()),
                    }
                );
                assert_eq!(
                    **b,
                    FilterExpr::Compare {
                        field: "severity".to_string(),
                        op: CmpOp::Le,
                        value: Value::Int(3),
                    }
                );
            }
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn count_with_and_without_parens_are_identical() {
        let a = parse_ok("search * | stats count");
        let b = parse_ok("search * | stats count()");
        assert_eq!(a, b);
    }

    #[test]
    fn parses_boolean_groups() {
        let p = parse_ok("search (host=a OR host=b) NOT severity=7");
        let Stage::Search(expr) = &p.stages[0] else {
            panic!()
        };
        match expr {
            FilterExpr::And(lhs, rhs) => {
                assert!(matches!(**lhs, FilterExpr::Or(_, _)));
                assert!(matches!(**rhs, FilterExpr::Not(_)));
            }
            other => panic!("expected AND of group and NOT, got {other:?}"),
        }
    }

    #[test]
    fn parses_timechart_span() {
        let p = parse_ok("search * | timechart span=1h count by hostname");
        match &p.stages[1] {
            Stage::Timechart { span, aggs, by } => {
                assert_eq!(span.as_secs(), 3600);
                assert_eq!(aggs.len(), 1);
                assert_eq!(by, &vec!["hostname".to_string()]);
            }
            other => panic!("expected timechart, got {other:?}"),
        }
    }

    #[test]
    fn parses_eval_precedence() {
        let p = parse_ok("search * | eval kb = bytes / 1024 + 1");
        let Stage::Eval(assignments) = &p.stages[1] else {
            panic!()
        };
        // (bytes / 1024) + 1
        match &assignments[0].1 {
            Expr::Binary { op: BinOp::Add, lhs, .. } => {
                assert!(matches!(**lhs, Expr::Binary { op: BinOp::Div, .. }));
            }
            other => panic!("expected +, got {other:?}"),
        }
    }

    #[test]
    fn parses_rex_with_default_field() {
        let p = parse_ok(r#"search * | rex "(?P<code>\d+)""#);
        assert_eq!(
            p.stages[1],
            Stage::Rex {
                field: "message".to_string(),
                pattern: r"(?P<code>\d+)".to_string(),
            }
        );
    }

    #[test]
    fn unknown_command_is_parse_error() {
        let err = parse("search * | frobnicate 3").unwrap_err();
        match err {
            QueryError::Parse { message, .. } => {
                assert!(message.contains("unknown command"), "{message}");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn top_defaults_to_ten() {
        let p = parse_ok("search * | top hostname");
        assert_eq!(
            p.stages[1],
            Stage::Top {
                n: 10,
                field: "hostname".to_string()
            }
        );
    }

    #[test]
    fn oversized_query_rejected() {
        let q = format!("search {}", "x".repeat(MAX_QUERY_BYTES));
        assert!(parse(&q).is_err());
    }

    #[test]
    fn round_trip_reprint() {
        let queries = [
            "search host=web-01 severity<=3 | stats count by hostname",
            "search * | timechart span=5m count, avg(severity) by app_name | sort desc count",
            "search (host=a OR host=b) | where NOT severity=7 | dedup hostname, app_name",
            "search * | eval kb = bytes / 1024, tag = concat(hostname, \"-x\") | fields - raw",
            "search * | top 5 hostname | rename count as hits",
            r#"search * | rex field=message "(?P<code>\d+)" | table hostname, code"#,
            "search * | stats p95(severity) as p95sev by hostname | tail 3",
            "search * | bin span=1h timestamp | head 10",
        ];
        for q in queries {
            let ast = parse_ok(q);
            let printed = ast.to_string();
            let reparsed = parse_ok(&printed);
            assert_eq!(ast, reparsed, "round-trip failed:\n  {q}\n  {printed}");
        }
    }
}

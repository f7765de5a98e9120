use serde_json::{Map, Value as Json};

use crate::dsl::ast::{BinOp, Expr};
use crate::extract::grok::cached_regex;

/// Scalar functions callable from `eval`.
const SCALAR_FUNCTIONS: &[&str] = &[
    "abs", "ceil", "floor", "round", "sqrt", "exp", "ln", "pow", "len", "lower", "upper",
    "substr", "trim", "replace", "concat", "tostring", "tonumber", "if", "case", "coalesce",
    "match", "now",
];

pub fn is_scalar_function(name: &str) -> bool {
    SCALAR_FUNCTIONS.contains(&name)
}

/// True when the planner can lower the expression to plain SQL in both
/// dialects. Regex, substring arithmetic and friends stay client-side.
pub fn sql_lowerable(expr: &Expr) -> bool {
    match expr {
        Expr::Num(_) | Expr::Str(_) | Expr::Field(_) => true,
        Expr::Neg(e) => sql_lowerable(e),
        Expr::Binary { lhs, rhs, .. } => sql_lowerable(lhs) && sql_lowerable(rhs),
        Expr::Call { name, args } => {
            matches!(
                name.as_str(),
                "abs" | "ceil" | "floor" | "round" | "lower" | "upper" | "concat" | "coalesce"
                    | "if"
            ) && args.iter().all(sql_lowerable)
        }
    }
}

pub fn as_number(v: &Json) -> Option<f64> {
    match v {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse::<f64>().ok(),
        Json::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn as_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        Json::Number(n) => match n.as_f64() {
            // Whole numbers print without the trailing ".0".
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Json::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

pub fn truthy(v: &Json) -> bool {
    match v {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

fn num(x: f64) -> Json {
    serde_json::Number::from_f64(x).map(Json::Number).unwrap_or(Json::Null)
}

/// Evaluate an eval expression against one row. Missing fields and type
/// mismatches yield null rather than errors; division by zero yields null.
pub fn eval_expr(expr: &Expr, row: &Map<String, Json>) -> Json {
    match expr {
        Expr::Num(x) => num(*x),
        Expr::Str(s) => Json::String(s.clone()),
        Expr::Field(name) => row.get(name).cloned().unwrap_or(Json::Null),
        Expr::Neg(e) => match as_number(&eval_expr(e, row)) {
            Some(x) => num(-x),
            None => Json::Null,
        },
        Expr::Binary { op, lhs, rhs } => {
            let l = eval_expr(lhs, row);
            let r = eval_expr(rhs, row);
            eval_binary(*op, &l, &r)
        }
        Expr::Call { name, args } => eval_call(name, args, row),
    }
}

fn eval_binary(op: BinOp, l: &Json, r: &Json) -> Json {
    match op {
        BinOp::Add => match (as_number(l), as_number(r)) {
            (Some(a), Some(b)) => num(a + b),
            // String + string concatenates.
            _ if l.is_string() || r.is_string() => {
                Json::String(format!("{}{}", as_string(l), as_string(r)))
            }
            _ => Json::Null,
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            let (Some(a), Some(b)) = (as_number(l), as_number(r)) else {
                return Json::Null;
            };
            match op {
                BinOp::Sub => num(a - b),
                BinOp::Mul => num(a * b),
                BinOp::Div => {
                    if b == 0.0 {
                        Json::Null
                    } else {
                        num(a / b)
                    }
                }
                BinOp::Mod => {
                    if b == 0.0 {
                        Json::Null
                    } else {
                        num(a % b)
                    }
                }
                _ => unreachable!(),
            }
        }
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (as_number(l), as_number(r)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(as_string(l).cmp(&as_string(r))),
            };
            let Some(ord) = ord else { return Json::Bool(false) };
            Json::Bool(match op {
                BinOp::Eq => ord.is_eq(),
                BinOp::Ne => !ord.is_eq(),
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                BinOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            })
        }
        BinOp::And => Json::Bool(truthy(l) && truthy(r)),
        BinOp::Or => Json::Bool(truthy(l) || truthy(r)),
    }
}

fn eval_call(name: &str, args: &[Expr], row: &Map<String, Json>) -> Json {
    let arg = |i: usize| -> Json {
        args.get(i).map(|e| eval_expr(e, row)).unwrap_or(Json::Null)
    };
    match name {
        "abs" | "ceil" | "floor" | "sqrt" | "exp" | "ln" => {
            let Some(x) = as_number(&arg(0)) else { return Json::Null };
            match name {
                "abs" => num(x.abs()),
                "ceil" => num(x.ceil()),
                "floor" => num(x.floor()),
                "sqrt" if x >= 0.0 => num(x.sqrt()),
                "exp" => num(x.exp()),
                "ln" if x > 0.0 => num(x.ln()),
                _ => Json::Null,
            }
        }
        "round" => {
            let Some(x) = as_number(&arg(0)) else { return Json::Null };
            let digits = as_number(&arg(1)).unwrap_or(0.0) as i32;
            let scale = 10f64.powi(digits);
            num((x * scale).round() / scale)
        }
        "pow" => match (as_number(&arg(0)), as_number(&arg(1))) {
            (Some(a), Some(b)) => num(a.powf(b)),
            _ => Json::Null,
        },
        "len" => num(as_string(&arg(0)).chars().count() as f64),
        "lower" => Json::String(as_string(&arg(0)).to_lowercase()),
        "upper" => Json::String(as_string(&arg(0)).to_uppercase()),
        "trim" => Json::String(as_string(&arg(0)).trim().to_string()),
        "substr" => {
            // 1-based start, optional length.
            let s = as_string(&arg(0));
            let chars: Vec<char> = s.chars().collect();
            let Some(start) = as_number(&arg(1)) else { return Json::Null };
            let start = (start as i64 - 1).max(0) as usize;
            if start >= chars.len() {
                return Json::String(String::new());
            }
            let end = match args.get(2).map(|e| eval_expr(e, row)).and_then(|v| as_number(&v)) {
                Some(len) if len >= 0.0 => (start + len as usize).min(chars.len()),
                _ => chars.len(),
            };
            Json::String(chars[start..end].iter().collect())
        }
        "replace" => {
            let s = as_string(&arg(0));
            let pat = as_string(&arg(1));
            let rep = as_string(&arg(2));
            match cached_regex(&pat) {
                Ok(re) => Json::String(re.replace_all(&s, rep.as_str()).into_owned()),
                Err(_) => Json::String(s.replace(&pat, &rep)),
            }
        }
        "concat" => {
            let mut out = String::new();
            for e in args {
                out.push_str(&as_string(&eval_expr(e, row)));
            }
            Json::String(out)
        }
        "tostring" => Json::String(as_string(&arg(0))),
        "tonumber" => match as_number(&arg(0)) {
            Some(x) => num(x),
            None => Json::Null,
        },
        "if" => {
            if truthy(&arg(0)) {
                arg(1)
            } else {
                arg(2)
            }
        }
        "case" => {
            // case(cond1, val1, cond2, val2, …[, default])
            let mut i = 0;
            while i + 1 < args.len() {
                if truthy(&eval_expr(&args[i], row)) {
                    return eval_expr(&args[i + 1], row);
                }
                i += 2;
            }
            if args.len() % 2 == 1 {
                return eval_expr(&args[args.len() - 1], row);
            }
            Json::Null
        }
        "coalesce" => {
            for e in args {
                let v = eval_expr(e, row);
                if !v.is_null() {
                    return v;
                }
            }
            Json::Null
        }
        "match" => {
            let s = as_string(&arg(0));
            let pat = as_string(&arg(1));
            match cached_regex(&pat) {
                Ok(re) => Json::Bool(re.is_match(&s)),
                Err(_) => Json::Bool(s.contains(&pat)),
            }
        }
        "now" => num(chrono::Utc::now().timestamp() as f64),
        _ => Json::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parser::parse;
    use crate::dsl::ast::Stage;
    use serde_json::json;

    fn expr_of(q: &str) -> Expr {
        let p = parse(q).unwrap();
        match &p.stages[1] {
            Stage::Eval(a) => a[0].1.clone(),
            other => panic!("expected eval, got {other:?}"),
        }
    }

    fn row(pairs: &[(&str, Json)]) -> Map<String, Json> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn arithmetic_and_division_by_zero() {
        let e = expr_of("search * | eval x = bytes / 1024");
        let r = row(&[("bytes", json!(2048))]);
        assert_eq!(eval_expr(&e, &r), json!(2.0));

        let e = expr_of("search * | eval x = 1 / n");
        let r = row(&[("n", json!(0))]);
        assert_eq!(eval_expr(&e, &r), Json::Null);
    }

    #[test]
    fn missing_field_is_null() {
        let e = expr_of("search * | eval x = nope + 1");
        assert_eq!(eval_expr(&e, &row(&[])), Json::Null);
    }

    #[test]
    fn if_and_coalesce() {
        let e = expr_of(r#"search * | eval tag = if(severity <= 3, "bad", "ok")"#);
        assert_eq!(eval_expr(&e, &row(&[("severity", json!(2))])), json!("bad"));
        assert_eq!(eval_expr(&e, &row(&[("severity", json!(6))])), json!("ok"));

        let e = expr_of("search * | eval v = coalesce(a, b, 7)");
        assert_eq!(eval_expr(&e, &row(&[("b", json!("x"))])), json!("x"));
        assert_eq!(eval_expr(&e, &row(&[])), json!(7.0));
    }

    #[test]
    fn case_with_default() {
        let e = expr_of(
            r#"search * | eval band = case(v < 10, "low", v < 100, "mid", "high")"#,
        );
        assert_eq!(eval_expr(&e, &row(&[("v", json!(5))])), json!("low"));
        assert_eq!(eval_expr(&e, &row(&[("v", json!(50))])), json!("mid"));
        assert_eq!(eval_expr(&e, &row(&[("v", json!(500))])), json!("high"));
    }

    #[test]
    fn string_functions() {
        let e = expr_of(r#"search * | eval s = substr("abcdef", 2, 3)"#);
        assert_eq!(eval_expr(&e, &row(&[])), json!("bcd"));

        let e = expr_of(r#"search * | eval s = concat(upper("ab"), "-", len("xyz"))"#);
        assert_eq!(eval_expr(&e, &row(&[])), json!("AB-3"));
    }

    #[test]
    fn regex_match() {
        let e = expr_of(r#"search * | eval m = match(message, "^GET /")"#);
        assert_eq!(
            eval_expr(&e, &row(&[("message", json!("GET /index"))])),
            json!(true)
        );
        assert_eq!(
            eval_expr(&e, &row(&[("message", json!("POST /x"))])),
            json!(false)
        );
    }

    #[test]
    fn lowerable_classification() {
        assert!(sql_lowerable(&expr_of("search * | eval x = a + b * 2")));
        assert!(sql_lowerable(&expr_of(r#"search * | eval x = if(a > 1, "y", "n")"#)));
        assert!(!sql_lowerable(&expr_of(r#"search * | eval x = match(a, "re")"#)));
        assert!(!sql_lowerable(&expr_of(r#"search * | eval x = substr(a, 1, 2)"#)));
    }
}

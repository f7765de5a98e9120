use serde::Serialize;

use crate::dsl::ast::{AggFunc, Expr, Pipeline, Stage};
use crate::dsl::eval::is_scalar_function;

/// Hard ceiling on limit/head/tail/top arguments.
pub const MAX_LIMIT: u64 = 100_000;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub message: String,
    pub stage_index: usize,
}

/// Outcome of the semantic pass. Warnings never block execution.
#[derive(Debug, Clone, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl Validation {
    pub fn first_error(&self) -> Option<&ValidationIssue> {
        self.errors.first()
    }
}

pub fn validate(pipeline: &Pipeline) -> Validation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (i, stage) in pipeline.stages.iter().enumerate() {
        match stage {
            Stage::Stats { aggs, by } | Stage::Timechart { aggs, by, .. } => {
                for agg in aggs {
                    if agg.func.requires_field() && agg.field.is_none() {
                        errors.push(ValidationIssue {
                            message: format!(
                                "aggregation '{}' requires a field argument",
                                agg.func.name()
                            ),
                            stage_index: i,
                        });
                    }
                    if !agg.func.requires_field() && agg.field.is_some() {
                        warnings.push(ValidationIssue {
                            message: format!(
                                "aggregation '{}' ignores its field argument",
                                agg.func.name()
                            ),
                            stage_index: i,
                        });
                    }
                    if let AggFunc::Percentile(p) = agg.func {
                        if !(1..=99).contains(&p) {
                            errors.push(ValidationIssue {
                                message: format!("percentile {p} out of range"),
                                stage_index: i,
                            });
                        }
                    }
                }
                if by.iter().any(|f| f.is_empty()) {
                    errors.push(ValidationIssue {
                        message: "empty field in 'by' list".to_string(),
                        stage_index: i,
                    });
                }
                if let Stage::Timechart { span, .. } = stage {
                    if span.as_millis() == 0 {
                        errors.push(ValidationIssue {
                            message: "timechart span must be positive".to_string(),
                            stage_index: i,
                        });
                    }
                }
            }
            Stage::Bin { span, .. } => {
                if span.as_millis() == 0 {
                    errors.push(ValidationIssue {
                        message: "bin span must be positive".to_string(),
                        stage_index: i,
                    });
                }
            }
            Stage::Limit(n) | Stage::Head(n) | Stage::Tail(n) => {
                check_limit(*n, stage.command_name(), i, &mut errors);
            }
            Stage::Top { n, .. } | Stage::Rare { n, .. } => {
                check_limit(*n, stage.command_name(), i, &mut errors);
            }
            Stage::Rex { pattern, .. } => match regex::Regex::new(pattern) {
                Ok(re) => {
                    if re.capture_names().flatten().count() == 0 {
                        warnings.push(ValidationIssue {
                            message: "rex pattern has no named capture groups".to_string(),
                            stage_index: i,
                        });
                    }
                }
                Err(e) => errors.push(ValidationIssue {
                    message: format!("rex pattern does not compile: {e}"),
                    stage_index: i,
                }),
            },
            Stage::Eval(assignments) => {
                for (name, expr) in assignments {
                    if name.is_empty() {
                        errors.push(ValidationIssue {
                            message: "eval target name is empty".to_string(),
                            stage_index: i,
                        });
                    }
                    check_expr(expr, i, &mut errors);
                }
            }
            Stage::Dedup(fields) | Stage::Table(fields) => {
                if fields.is_empty() {
                    errors.push(ValidationIssue {
                        message: format!("{} requires at least one field", stage.command_name()),
                        stage_index: i,
                    });
                }
            }
            Stage::Search(_) | Stage::Where(_) | Stage::Sort { .. } | Stage::Fields { .. }
            | Stage::Rename(_) => {}
        }
    }

    // Aggregations are only legal inside stats/timechart; the grammar already
    // guarantees that, but eval expressions may try to smuggle one in.
    Validation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_limit(n: u64, command: &str, stage_index: usize, errors: &mut Vec<ValidationIssue>) {
    if n == 0 {
        errors.push(ValidationIssue {
            message: format!("{command} must be positive"),
            stage_index,
        });
    } else if n > MAX_LIMIT {
        errors.push(ValidationIssue {
            message: format!("{command} exceeds the maximum of {MAX_LIMIT}"),
            stage_index,
        });
    }
}

fn check_expr(expr: &Expr, stage_index: usize, errors: &mut Vec<ValidationIssue>) {
    match expr {
        Expr::Call { name, args } => {
            if AggFunc::from_name(name).is_some() {
                errors.push(ValidationIssue {
                    message: format!(
                        "aggregation '{name}' is only allowed inside stats or timechart"
                    ),
                    stage_index,
                });
            } else if !is_scalar_function(name) {
                errors.push(ValidationIssue {
                    message: format!("unknown function '{name}'"),
                    stage_index,
                });
            }
            for a in args {
                check_expr(a, stage_index, errors);
            }
        }
        Expr::Neg(e) => check_expr(e, stage_index, errors),
        Expr::Binary { lhs, rhs, .. } => {
            check_expr(lhs, stage_index, errors);
            check_expr(rhs, stage_index, errors);
        }
        Expr::Num(_) | Expr::Str(_) | Expr::Field(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parser::parse;

    #[test]
    fn valid_pipeline_passes() {
        let p = parse("search * | stats count by hostname | limit 10").unwrap();
        let v = validate(&p);
        assert!(v.valid, "{:?}", v.errors);
    }

    #[test]
    fn agg_without_field_is_error() {
        let p = parse("search * | stats avg").unwrap();
        let v = validate(&p);
        assert!(!v.valid);
        assert_eq!(v.errors[0].stage_index, 1);
    }

    #[test]
    fn zero_limit_is_error() {
        let p = parse("search * | limit 0").unwrap();
        assert!(!validate(&p).valid);
    }

    #[test]
    fn oversized_limit_is_error() {
        let p = parse("search * | head 200000").unwrap();
        assert!(!validate(&p).valid);
    }

    #[test]
    fn bad_rex_is_error() {
        let p = parse(r#"search * | rex "(unclosed""#).unwrap();
        assert!(!validate(&p).valid);
    }

    #[test]
    fn unknown_eval_function_is_error() {
        let p = parse("search * | eval x = frob(1)").unwrap();
        let v = validate(&p);
        assert!(!v.valid);
        assert!(v.errors[0].message.contains("unknown function"));
    }

    #[test]
    fn aggregation_inside_eval_is_error() {
        let p = parse("search * | eval x = avg(severity)").unwrap();
        assert!(!validate(&p).valid);
    }

    #[test]
    fn warnings_do_not_block() {
        let p = parse("search * | stats count(hostname)").unwrap();
        let v = validate(&p);
        assert!(v.valid);
        assert_eq!(v.warnings.len(), 1);
    }
}

pub mod builtin;
pub mod grok;
pub mod ipclass;
pub mod stacktrace;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// How a user pattern is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Regex,
    Grok,
}

/// A catalog-stored extraction pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPattern {
    pub id: String,
    pub name: String,
    pub pattern: String,
    pub pattern_type: PatternType,
    /// Lower runs first.
    pub priority: i64,
    pub field_prefix: Option<String>,
    pub enabled: bool,
}

struct CompiledPattern {
    regex: Arc<Regex>,
    names: Vec<String>,
    prefix: Option<String>,
}

fn compile_user_pattern(p: &UserPattern) -> Result<CompiledPattern, QueryError> {
    let regex = match p.pattern_type {
        PatternType::Regex => grok::cached_regex(&p.pattern)
            .map_err(|e| QueryError::Extraction(format!("pattern '{}': {e}", p.name)))?,
        PatternType::Grok => grok::compile_grok(&p.pattern)?,
    };
    let names = regex
        .capture_names()
        .flatten()
        .map(|s| s.to_string())
        .collect();
    Ok(CompiledPattern {
        regex,
        names,
        prefix: p.field_prefix.clone(),
    })
}

/// Three extraction layers applied in order: JSON, built-in patterns, user
/// patterns. Once a key is set, lower-priority layers cannot overwrite it.
pub struct FieldExtractor {
    patterns: RwLock<Arc<Vec<CompiledPattern>>>,
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldExtractor {
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Compile and atomically swap in a new pattern set, ordered by
    /// `(priority, name)` ascending. Patterns that fail to compile are
    /// skipped with a log line rather than poisoning the reload.
    pub fn load_patterns(&self, patterns: &[UserPattern]) {
        let mut enabled: Vec<&UserPattern> = patterns.iter().filter(|p| p.enabled).collect();
        enabled.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        let mut compiled = Vec::with_capacity(enabled.len());
        for p in enabled {
            match compile_user_pattern(p) {
                Ok(c) => compiled.push(c),
                Err(e) => {
                    tracing::warn!("extraction pattern '{}' skipped: {e}", p.name);
                }
            }
        }
        *self.patterns.write().unwrap() = Arc::new(compiled);
    }

    /// Extract structured fields from one message.
    pub fn extract(&self, message: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();

        // 1. JSON layer.
        let trimmed = message.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(serde_json::Value::Object(map)) =
                serde_json::from_str::<serde_json::Value>(trimmed)
            {
                for (key, value) in map {
                    flatten_json(&key, &value, &mut out);
                }
            }
        }

        // 2. Built-in patterns and scanners.
        builtin::apply_builtins(message, &mut out);

        // 3. User patterns by ascending priority.
        let patterns = self.patterns.read().unwrap().clone();
        for pattern in patterns.iter() {
            if let Some(caps) = pattern.regex.captures(message) {
                for name in &pattern.names {
                    if let Some(m) = caps.name(name) {
                        let key = match &pattern.prefix {
                            Some(prefix) => format!("{prefix}.{name}"),
                            None => name.clone(),
                        };
                        out.entry(key).or_insert_with(|| m.as_str().to_string());
                    }
                }
            }
        }

        out
    }

    /// Dry-run a pattern against a sample without touching catalog state.
    pub fn test_pattern(
        pattern_type: PatternType,
        pattern: &str,
        sample: &str,
    ) -> Result<BTreeMap<String, String>, QueryError> {
        let regex = match pattern_type {
            PatternType::Regex => grok::cached_regex(pattern)
                .map_err(|e| QueryError::Extraction(e.to_string()))?,
            PatternType::Grok => grok::compile_grok(pattern)?,
        };
        let mut out = BTreeMap::new();
        if let Some(caps) = regex.captures(sample) {
            for name in regex.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    out.insert(name.to_string(), m.as_str().to_string());
                }
            }
        }
        Ok(out)
    }
}

/// Flatten nested objects with dotted paths; arrays serialize to JSON.
fn flatten_json(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                flatten_json(&format!("{prefix}.{key}"), nested, out);
            }
        }
        serde_json::Value::Array(_) => {
            out.entry(prefix.to_string())
                .or_insert_with(|| value.to_string());
        }
        serde_json::Value::Null => {}
        serde_json::Value::String(s) => {
            out.entry(prefix.to_string()).or_insert_with(|| s.clone());
        }
        other => {
            out.entry(prefix.to_string())
                .or_insert_with(|| crate::dsl::eval::as_string(other));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(name: &str, priority: i64, pattern: &str, ty: PatternType) -> UserPattern {
        UserPattern {
            id: name.to_string(),
            name: name.to_string(),
            pattern: pattern.to_string(),
            pattern_type: ty,
            priority,
            field_prefix: None,
            enabled: true,
        }
    }

    #[test]
    fn json_layer_flattens_nested_objects() {
        let ex = FieldExtractor::new();
        let fields =
            ex.extract(r#"{"user": {"name": "alice", "id": 7}, "tags": ["a", "b"], "ok": true}"#);
        assert_eq!(fields["user.name"], "alice");
        assert_eq!(fields["user.id"], "7");
        assert_eq!(fields["tags"], r#"["a","b"]"#);
        assert_eq!(fields["ok"], "true");
    }

    #[test]
    fn user_patterns_run_in_priority_order() {
        let ex = FieldExtractor::new();
        ex.load_patterns(&[
            pattern("late", 20, r"(?P<who>\w+) logged in", PatternType::Regex),
            pattern("early", 10, r"(?P<who>\w+) logged", PatternType::Regex),
        ]);
        let fields = ex.extract("alice logged in");
        // Both match; the lower priority value sticks.
        assert_eq!(fields["who"], "alice");
    }

    #[test]
    fn higher_layer_keys_win() {
        let ex = FieldExtractor::new();
        ex.load_patterns(&[pattern(
            "grab-ip",
            1,
            r"ip=(?P<ip>\S+)",
            PatternType::Regex,
        )]);
        // Scanner sets `ip` first; the user pattern must not overwrite it.
        let fields = ex.extract("from 10.0.0.1 ip=spoofed");
        assert_eq!(fields["ip"], "10.0.0.1");
    }

    #[test]
    fn grok_user_pattern() {
        let ex = FieldExtractor::new();
        ex.load_patterns(&[pattern(
            "req",
            5,
            "%{WORD:verb} %{PATH:route} took %{NUMBER:elapsed}ms",
            PatternType::Grok,
        )]);
        let fields = ex.extract("GET /api/users took 42ms");
        assert_eq!(fields["verb"], "GET");
        assert_eq!(fields["route"], "/api/users");
        assert_eq!(fields["elapsed"], "42");
    }

    #[test]
    fn bad_pattern_is_skipped_not_fatal() {
        let ex = FieldExtractor::new();
        ex.load_patterns(&[
            pattern("broken", 1, "(unclosed", PatternType::Regex),
            pattern("fine", 2, r"code=(?P<code>\d+)", PatternType::Regex),
        ]);
        let fields = ex.extract("code=7");
        assert_eq!(fields["code"], "7");
    }

    #[test]
    fn test_pattern_is_pure() {
        let fields = FieldExtractor::test_pattern(
            PatternType::Grok,
            "%{IP:client}",
            "from 192.168.1.9 port 22",
        )
        .unwrap();
        assert_eq!(fields["client"], "192.168.1.9");
        assert!(FieldExtractor::test_pattern(PatternType::Regex, "(bad", "x").is_err());
    }
}

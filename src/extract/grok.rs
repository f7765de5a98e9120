use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::QueryError;

/// Process-wide compiled-regex cache. Shared by eval's `match`/`replace`,
/// the SQLite REGEXP shim, rex, and user extraction patterns.
static REGEX_CACHE: Lazy<Mutex<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn cached_regex(pattern: &str) -> Result<Arc<Regex>, regex::Error> {
    if let Some(re) = REGEX_CACHE.lock().unwrap().get(pattern) {
        return Ok(re.clone());
    }
    let re = Arc::new(Regex::new(pattern)?);
    REGEX_CACHE
        .lock()
        .unwrap()
        .insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Fixed Grok substitution table. `%{PAT}` expands to a non-capturing group,
/// `%{PAT:name}` to a named capture.
const GROK_PATTERNS: &[(&str, &str)] = &[
    ("IPV4", r"(?:\d{1,3}\.){3}\d{1,3}"),
    ("IPV6", r"(?:[0-9A-Fa-f]{0,4}:){2,7}[0-9A-Fa-f:.]{1,27}"),
    ("IP", r"(?:(?:\d{1,3}\.){3}\d{1,3}|(?:[0-9A-Fa-f]{0,4}:){2,7}[0-9A-Fa-f:.]{1,27})"),
    (
        "HOSTNAME",
        r"(?:[0-9A-Za-z][0-9A-Za-z-]{0,62})(?:\.(?:[0-9A-Za-z][0-9A-Za-z-]{0,62}))*\.?",
    ),
    ("NUMBER", r"-?\d+(?:\.\d+)?"),
    ("BASE10NUM", r"[+-]?(?:\d+(?:\.\d+)?|\.\d+)"),
    ("INT", r"[+-]?\d+"),
    ("POSINT", r"\d+"),
    ("WORD", r"\b\w+\b"),
    ("NOTSPACE", r"\S+"),
    ("SPACE", r"\s*"),
    ("DATA", r".*?"),
    ("GREEDYDATA", r".*"),
    ("QUOTEDSTRING", r#""[^"]*""#),
    (
        "UUID",
        r"[0-9a-fA-F]{8}-(?:[0-9a-fA-F]{4}-){3}[0-9a-fA-F]{12}",
    ),
    (
        "EMAILADDRESS",
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[A-Za-z]{2,}",
    ),
    (
        "TIMESTAMP_ISO8601",
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
    ),
    ("SYSLOGTIMESTAMP", r"[A-Z][a-z]{2} +\d{1,2} \d{2}:\d{2}:\d{2}"),
    (
        "LOGLEVEL",
        r"(?i:TRACE|DEBUG|INFO|NOTICE|WARN(?:ING)?|ERR(?:OR)?|CRIT(?:ICAL)?|FATAL|ALERT|EMERG(?:ENCY)?)",
    ),
    ("PATH", r"(?:/[^\s?#]*)+"),
];

fn lookup(name: &str) -> Option<&'static str> {
    GROK_PATTERNS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, p)| *p)
}

/// Expand a Grok template into a plain regex string.
pub fn grok_to_regex(template: &str) -> Result<String, QueryError> {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;
    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(QueryError::Extraction(format!(
                "unterminated grok token in '{template}'"
            )));
        };
        let token = &after[..end];
        let (name, capture) = match token.split_once(':') {
            Some((n, c)) => (n, Some(c)),
            None => (token, None),
        };
        let pattern = lookup(name).ok_or_else(|| {
            QueryError::Extraction(format!("unknown grok pattern '{name}'"))
        })?;
        match capture {
            Some(field) => {
                if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(QueryError::Extraction(format!(
                        "invalid grok capture name '{field}'"
                    )));
                }
                out.push_str(&format!("(?P<{field}>{pattern})"));
            }
            None => out.push_str(&format!("(?:{pattern})")),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Compiled Grok templates, cached by the original template string.
static GROK_CACHE: Lazy<Mutex<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn compile_grok(template: &str) -> Result<Arc<Regex>, QueryError> {
    if let Some(re) = GROK_CACHE.lock().unwrap().get(template) {
        return Ok(re.clone());
    }
    let expanded = grok_to_regex(template)?;
    let re = cached_regex(&expanded)
        .map_err(|e| QueryError::Extraction(format!("grok '{template}': {e}")))?;
    GROK_CACHE
        .lock()
        .unwrap()
        .insert(template.to_string(), re.clone());
    Ok(re)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_named_and_anonymous_tokens() {
        let re = compile_grok("%{IP:client} - %{WORD:method}").unwrap();
        let caps = re.captures("10.0.0.1 - GET /x").unwrap();
        assert_eq!(&caps["client"], "10.0.0.1");
        assert_eq!(&caps["method"], "GET");

        let re = compile_grok("%{IP} %{NUMBER:code}").unwrap();
        let caps = re.captures("10.0.0.1 200").unwrap();
        assert_eq!(&caps["code"], "200");
        assert!(caps.name("client").is_none());
    }

    #[test]
    fn iso_timestamp_token() {
        let re = compile_grok("%{TIMESTAMP_ISO8601:ts}").unwrap();
        let caps = re.captures("at 2023-10-10T13:55:36.123Z end").unwrap();
        assert_eq!(&caps["ts"], "2023-10-10T13:55:36.123Z");
    }

    #[test]
    fn unknown_token_is_error() {
        assert!(grok_to_regex("%{NOPE:x}").is_err());
    }

    #[test]
    fn cache_returns_same_compilation() {
        let a = compile_grok("%{WORD:w}").unwrap();
        let b = compile_grok("%{WORD:w}").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn plain_regex_cache_round_trips() {
        let a = cached_regex(r"\d+").unwrap();
        let b = cached_regex(r"\d+").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(cached_regex("(unclosed").is_err());
    }
}

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Full-line formats, tried in order; the first match wins and its keys are
/// prefixed with the pattern name.
pub struct BuiltinPattern {
    pub name: &'static str,
    pub regex: Regex,
}

pub static FULL_LINE_PATTERNS: Lazy<Vec<BuiltinPattern>> = Lazy::new(|| {
    let defs: &[(&str, &str)] = &[
        (
            "apache_combined",
            r#"^(?P<client_ip>\S+) (?P<ident>\S+) (?P<user>\S+) \[(?P<timestamp>[^\]]+)\] "(?P<method>\S+) (?P<path>\S+)(?: (?P<protocol>[^"]*))?" (?P<status>\d{3}) (?P<bytes>\d+|-) "(?P<referrer>[^"]*)" "(?P<user_agent>[^"]*)"$"#,
        ),
        (
            "apache_common",
            r#"^(?P<client_ip>\S+) (?P<ident>\S+) (?P<user>\S+) \[(?P<timestamp>[^\]]+)\] "(?P<method>\S+) (?P<path>\S+)(?: (?P<protocol>[^"]*))?" (?P<status>\d{3}) (?P<bytes>\d+|-)$"#,
        ),
        (
            "nginx_access",
            r#"^(?P<remote_addr>\S+) - (?P<remote_user>\S+) \[(?P<timestamp>[^\]]+)\] "(?P<request>[^"]*)" (?P<status>\d{3}) (?P<bytes>\d+) "(?P<referrer>[^"]*)" "(?P<user_agent>[^"]*)" "(?P<forwarded_for>[^"]*)"$"#,
        ),
        (
            "syslog_rfc5424",
            r"^<(?P<pri>\d{1,3})>(?P<version>\d) (?P<timestamp>\S+) (?P<host>\S+) (?P<app>\S+) (?P<procid>\S+) (?P<msgid>\S+) (?P<sd>-|\[.*\]) ?(?P<content>.*)$",
        ),
        (
            "syslog_rfc3164",
            r"^<(?P<pri>\d{1,3})>(?P<timestamp>[A-Z][a-z]{2} +\d{1,2} \d{2}:\d{2}:\d{2}) (?P<host>\S+) (?P<tag>[^:\[\s]+)(?:\[(?P<pid>\d+)\])?: ?(?P<content>.*)$",
        ),
        (
            "bracketed_error",
            r"^\[(?P<timestamp>[^\]]+)\] \[(?P<level>[^\]]+)\](?: \[(?P<module>[^\]]+)\])? (?P<content>.*)$",
        ),
    ];
    defs.iter()
        .map(|(name, pattern)| BuiltinPattern {
            name,
            regex: Regex::new(pattern).expect("builtin pattern must compile"),
        })
        .collect()
});

struct Scanner {
    key: &'static str,
    regex: Regex,
}

static SCANNERS: Lazy<Vec<Scanner>> = Lazy::new(|| {
    let defs: &[(&str, &str)] = &[
        ("ip", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
        ("url", r#"https?://[^\s"'<>]+"#),
        (
            "uuid",
            r"\b[0-9a-fA-F]{8}-(?:[0-9a-fA-F]{4}-){3}[0-9a-fA-F]{12}\b",
        ),
        (
            "email",
            r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[A-Za-z]{2,}\b",
        ),
    ];
    defs.iter()
        .map(|(key, pattern)| Scanner {
            key,
            regex: Regex::new(pattern).expect("scanner pattern must compile"),
        })
        .collect()
});

static DURATION_SCAN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d+(?:\.\d+)?)\s?(ms|milliseconds?|s|sec|seconds?)\b").unwrap()
});

fn insert_if_absent(out: &mut BTreeMap<String, String>, key: String, value: String) {
    out.entry(key).or_insert(value);
}

/// Apply the first matching full-line pattern, then the value scanners.
/// Existing keys are never overwritten.
pub fn apply_builtins(message: &str, out: &mut BTreeMap<String, String>) {
    for pattern in FULL_LINE_PATTERNS.iter() {
        if let Some(caps) = pattern.regex.captures(message) {
            for name in pattern.regex.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    insert_if_absent(
                        out,
                        format!("{}.{}", pattern.name, name),
                        m.as_str().to_string(),
                    );
                }
            }
            break;
        }
    }

    for scanner in SCANNERS.iter() {
        let matches: Vec<&str> = scanner
            .regex
            .find_iter(message)
            .map(|m| m.as_str())
            .collect();
        if let Some(first) = matches.first() {
            insert_if_absent(out, scanner.key.to_string(), (*first).to_string());
            if matches.len() > 1 {
                let arr = serde_json::to_string(&matches).unwrap_or_default();
                insert_if_absent(out, format!("{}s", scanner.key), arr);
            }
        }
    }

    // Durations normalize to milliseconds.
    let durations: Vec<f64> = DURATION_SCAN
        .captures_iter(message)
        .filter_map(|caps| {
            let value: f64 = caps[1].parse().ok()?;
            let unit = &caps[2];
            Some(if unit.starts_with('s') { value * 1000.0 } else { value })
        })
        .collect();
    if let Some(first) = durations.first() {
        insert_if_absent(out, "duration_ms".to_string(), format_ms(*first));
        if durations.len() > 1 {
            let arr: Vec<String> = durations.iter().map(|d| format_ms(*d)).collect();
            insert_if_absent(
                out,
                "durations_ms".to_string(),
                serde_json::to_string(&arr).unwrap_or_default(),
            );
        }
    }
}

fn format_ms(ms: f64) -> String {
    if ms.fract() == 0.0 {
        format!("{}", ms as i64)
    } else {
        format!("{ms}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(message: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        apply_builtins(message, &mut out);
        out
    }

    #[test]
    fn apache_common_line() {
        let fields = extract(
            r#"127.0.0.1 - - [10/Oct/2023:13:55:36 +0000] "GET /index.html HTTP/1.1" 200 2326"#,
        );
        assert_eq!(fields["apache_common.client_ip"], "127.0.0.1");
        assert_eq!(fields["apache_common.method"], "GET");
        assert_eq!(fields["apache_common.status"], "200");
        assert_eq!(fields["apache_common.path"], "/index.html");
    }

    #[test]
    fn apache_combined_wins_over_common() {
        let fields = extract(
            r#"10.1.2.3 - alice [10/Oct/2023:13:55:36 +0000] "POST /api HTTP/1.1" 201 12 "http://ref" "curl/8.0""#,
        );
        assert_eq!(fields["apache_combined.user"], "alice");
        assert_eq!(fields["apache_combined.user_agent"], "curl/8.0");
        assert!(!fields.contains_key("apache_common.client_ip"));
    }

    #[test]
    fn rfc3164_line() {
        let fields = extract("<34>Oct 11 22:14:15 mymachine su[123]: 'su root' failed");
        assert_eq!(fields["syslog_rfc3164.pri"], "34");
        assert_eq!(fields["syslog_rfc3164.host"], "mymachine");
        assert_eq!(fields["syslog_rfc3164.tag"], "su");
        assert_eq!(fields["syslog_rfc3164.pid"], "123");
    }

    #[test]
    fn scanners_pick_out_values() {
        let fields = extract(
            "user bob@example.com hit 10.0.0.5 then 10.0.0.6 via https://api.example.com/v1 in 250 ms",
        );
        assert_eq!(fields["ip"], "10.0.0.5");
        assert!(fields["ips"].contains("10.0.0.6"));
        assert_eq!(fields["email"], "bob@example.com");
        assert_eq!(fields["url"], "https://api.example.com/v1");
        assert_eq!(fields["duration_ms"], "250");
    }

    #[test]
    fn duration_seconds_normalize_to_ms() {
        let fields = extract("request took 1.5 s total");
        assert_eq!(fields["duration_ms"], "1500");
    }

    #[test]
    fn existing_keys_are_not_overwritten() {
        let mut out = BTreeMap::new();
        out.insert("ip".to_string(), "preset".to_string());
        apply_builtins("from 10.0.0.9", &mut out);
        assert_eq!(out["ip"], "preset");
    }
}

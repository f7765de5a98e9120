use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde_json::Value as Json;

use crate::models::event::Event;

/// Which payload parser accepted the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Rfc5424,
    Rfc3164,
    Json,
    Raw,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Rfc5424 => "rfc5424",
            SourceType::Rfc3164 => "rfc3164",
            SourceType::Json => "json",
            SourceType::Raw => "raw",
        }
    }
}

/// Parse one frame, trying RFC 5424, RFC 3164, JSON, then the permissive
/// fallback that keeps the raw line. Never fails.
pub fn parse_payload(payload: &str, now: DateTime<Utc>) -> (Event, SourceType) {
    let payload = payload.trim_end_matches(['\r', '\n']);
    if let Some(event) = parse_rfc5424(payload, now) {
        return (event, SourceType::Rfc5424);
    }
    if let Some(event) = parse_rfc3164(payload, now) {
        return (event, SourceType::Rfc3164);
    }
    if let Some(event) = parse_json_frame(payload, now) {
        return (event, SourceType::Json);
    }

    let mut event = Event::default();
    event.timestamp = now;
    event.received_at = now;
    event.message = payload.to_string();
    event.raw = payload.to_string();
    (event, SourceType::Raw)
}

/// `<PRI>` header shared by both syslog formats. PRI is 0..=191.
fn parse_pri(payload: &str) -> Option<(u8, u8, &str)> {
    let rest = payload.strip_prefix('<')?;
    let end = rest.find('>')?;
    if end == 0 || end > 3 {
        return None;
    }
    let pri: u16 = rest[..end].parse().ok()?;
    if pri > 191 {
        return None;
    }
    Some(((pri / 8) as u8, (pri % 8) as u8, &rest[end + 1..]))
}

fn dash_empty(s: &str) -> String {
    if s == "-" { String::new() } else { s.to_string() }
}

/// `<PRI>VERSION TS HOST APP PROCID MSGID SD MSG`
fn parse_rfc5424(payload: &str, now: DateTime<Utc>) -> Option<Event> {
    let (facility, severity, rest) = parse_pri(payload)?;
    let rest = rest.strip_prefix("1 ")?;

    let mut parts = rest.splitn(6, ' ');
    let ts = parts.next()?;
    let host = parts.next()?;
    let app = parts.next()?;
    let procid = parts.next()?;
    let msgid = parts.next()?;
    let tail = parts.next().unwrap_or("");

    let timestamp = if ts == "-" {
        now
    } else {
        DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc)
    };

    let (sd, message) = split_structured_data(tail)?;

    let mut event = Event::default();
    event.timestamp = timestamp;
    event.received_at = now;
    event.facility = facility;
    event.severity = severity;
    event.hostname = dash_empty(host);
    event.app_name = dash_empty(app);
    event.message = message.trim_start().to_string();
    event.raw = payload.to_string();
    if !procid.is_empty() && procid != "-" {
        event
            .structured_data
            .insert("procid".to_string(), procid.to_string());
    }
    if !msgid.is_empty() && msgid != "-" {
        event
            .structured_data
            .insert("msgid".to_string(), msgid.to_string());
    }
    parse_sd_elements(&sd, &mut event);
    Some(event)
}

/// Split the SD block (`-` or one or more `[...]` elements) from the MSG.
fn split_structured_data(tail: &str) -> Option<(String, String)> {
    if let Some(rest) = tail.strip_prefix('-') {
        return Some((String::new(), rest.to_string()));
    }
    if !tail.starts_with('[') {
        return None;
    }
    let bytes = tail.as_bytes();
    let mut i = 0;
    let mut in_quotes = false;
    let mut depth = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' if i == 0 || bytes[i - 1] != b'\\' => in_quotes = !in_quotes,
            b'[' if !in_quotes => depth += 1,
            b']' if !in_quotes => {
                depth -= 1;
                if depth == 0 && (i + 1 >= bytes.len() || bytes[i + 1] != b'[') {
                    return Some((tail[..=i].to_string(), tail[i + 1..].to_string()));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Flatten `[id k="v" ...]` elements into `id.k` keys.
fn parse_sd_elements(sd: &str, event: &mut Event) {
    let mut rest = sd;
    while let Some(start) = rest.find('[') {
        let Some(end) = rest[start..].find(']') else { break };
        let element = &rest[start + 1..start + end];
        rest = &rest[start + end + 1..];

        let mut tokens = element.splitn(2, ' ');
        let Some(id) = tokens.next() else { continue };
        let id = id.split('@').next().unwrap_or(id);
        let Some(params) = tokens.next() else { continue };

        let mut cursor = params;
        while let Some(eq) = cursor.find('=') {
            let key = cursor[..eq].trim();
            let after = &cursor[eq + 1..];
            let Some(q) = after.strip_prefix('"') else { break };
            let Some(close) = q.find('"') else { break };
            let value = &q[..close];
            if !key.is_empty() {
                event
                    .structured_data
                    .entry(format!("{id}.{key}"))
                    .or_insert_with(|| value.to_string());
            }
            cursor = q[close + 1..].trim_start();
        }
    }
}

const MONTHS: &[&str] = &[
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// `<PRI>MON DD HH:MM:SS HOST TAG[pid]: MSG`
fn parse_rfc3164(payload: &str, now: DateTime<Utc>) -> Option<Event> {
    let (facility, severity, rest) = parse_pri(payload)?;

    let month = MONTHS.iter().position(|m| rest.starts_with(m))? as u32 + 1;
    let rest = &rest[3..];
    let rest = rest.strip_prefix(' ')?;
    // Day may be space-padded.
    let rest = rest.trim_start();
    let day_end = rest.find(' ')?;
    let day: u32 = rest[..day_end].parse().ok()?;
    let rest = rest[day_end..].trim_start();
    if rest.len() < 9 {
        return None;
    }
    let (hms, rest) = rest.split_at(8);
    let mut hms_parts = hms.split(':');
    let hour: u32 = hms_parts.next()?.parse().ok()?;
    let minute: u32 = hms_parts.next()?.parse().ok()?;
    let second: u32 = hms_parts.next()?.parse().ok()?;
    let rest = rest.strip_prefix(' ')?;

    // No year on the wire: pick the current year, stepping back one when the
    // result would land more than a day in the future.
    let mut timestamp = Utc
        .with_ymd_and_hms(now.year(), month, day, hour, minute, second)
        .single()?;
    if timestamp > now + chrono::Duration::days(1) {
        timestamp = Utc
            .with_ymd_and_hms(now.year() - 1, month, day, hour, minute, second)
            .single()?;
    }

    let mut parts = rest.splitn(2, ' ');
    let host = parts.next()?;
    let tail = parts.next().unwrap_or("");

    let (tag, pid, message) = match tail.split_once(':') {
        Some((head, msg)) => match head.find('[') {
            Some(b) if head.ends_with(']') => (
                head[..b].to_string(),
                Some(head[b + 1..head.len() - 1].to_string()),
                msg.trim_start(),
            ),
            _ => (head.to_string(), None, msg.trim_start()),
        },
        None => (String::new(), None, tail),
    };

    let mut event = Event::default();
    event.timestamp = timestamp;
    event.received_at = now;
    event.facility = facility;
    event.severity = severity;
    event.hostname = host.to_string();
    event.app_name = tag;
    event.message = message.to_string();
    event.raw = payload.to_string();
    if let Some(pid) = pid {
        event.structured_data.insert("procid".to_string(), pid);
    }
    Some(event)
}

fn severity_from_name(name: &str) -> Option<u8> {
    Some(match name.to_ascii_lowercase().as_str() {
        "emerg" | "emergency" | "panic" => 0,
        "alert" => 1,
        "crit" | "critical" | "fatal" => 2,
        "err" | "error" => 3,
        "warn" | "warning" => 4,
        "notice" => 5,
        "info" | "informational" => 6,
        "debug" | "trace" => 7,
        _ => return None,
    })
}

/// Whole payload is one JSON object.
fn parse_json_frame(payload: &str, now: DateTime<Utc>) -> Option<Event> {
    let trimmed = payload.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let Json::Object(map) = serde_json::from_str::<Json>(trimmed).ok()? else {
        return None;
    };

    let mut event = Event::default();
    event.received_at = now;
    event.timestamp = now;
    event.raw = payload.to_string();

    let mut consumed: Vec<&str> = Vec::new();
    for key in ["timestamp", "time", "@timestamp", "ts"] {
        if let Some(Json::String(s)) = map.get(key) {
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                event.timestamp = t.with_timezone(&Utc);
                consumed.push(key);
                break;
            }
        }
    }
    for key in ["hostname", "host"] {
        if let Some(Json::String(s)) = map.get(key) {
            event.hostname = s.clone();
            consumed.push(key);
            break;
        }
    }
    for key in ["app_name", "app", "service", "program"] {
        if let Some(Json::String(s)) = map.get(key) {
            event.app_name = s.clone();
            consumed.push(key);
            break;
        }
    }
    for key in ["message", "msg", "body"] {
        if let Some(Json::String(s)) = map.get(key) {
            event.message = s.clone();
            consumed.push(key);
            break;
        }
    }
    for key in ["severity", "level"] {
        match map.get(key) {
            Some(Json::Number(n)) => {
                if let Some(v) = n.as_u64() {
                    event.severity = v.min(7) as u8;
                    consumed.push(key);
                    break;
                }
            }
            Some(Json::String(s)) => {
                if let Some(v) = severity_from_name(s) {
                    event.severity = v;
                    consumed.push(key);
                    break;
                }
            }
            _ => {}
        }
    }
    if let Some(Json::Number(n)) = map.get("facility") {
        if let Some(v) = n.as_u64() {
            event.facility = v.min(23) as u8;
            consumed.push("facility");
        }
    }

    for (key, value) in &map {
        if consumed.contains(&key.as_str()) {
            continue;
        }
        let rendered = match value {
            Json::String(s) => s.clone(),
            Json::Null => continue,
            other => other.to_string(),
        };
        event.structured_data.insert(key.clone(), rendered);
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn rfc5424_full_frame() {
        let now = at("2023-10-11T22:14:20Z");
        let (event, ty) = parse_payload(
            "<165>1 2023-10-11T22:14:15.003Z web-01 app 1234 ID47 \
             [meta@47450 seq=\"22\" env=\"prod\"] An application event",
            now,
        );
        assert_eq!(ty, SourceType::Rfc5424);
        assert_eq!(event.facility, 20);
        assert_eq!(event.severity, 5);
        assert_eq!(event.priority(), 165);
        assert_eq!(event.hostname, "web-01");
        assert_eq!(event.app_name, "app");
        assert_eq!(event.message, "An application event");
        assert_eq!(event.structured_data["meta.seq"], "22");
        assert_eq!(event.structured_data["meta.env"], "prod");
        assert_eq!(event.structured_data["procid"], "1234");
    }

    #[test]
    fn rfc5424_nil_fields() {
        let now = at("2023-10-11T22:14:20Z");
        let (event, ty) = parse_payload("<34>1 - - - - - - standalone message", now);
        assert_eq!(ty, SourceType::Rfc5424);
        assert_eq!(event.timestamp, now);
        assert_eq!(event.hostname, "");
        assert_eq!(event.message, "standalone message");
    }

    #[test]
    fn rfc3164_frame() {
        let now = at("2023-10-12T01:00:00Z");
        let (event, ty) =
            parse_payload("<34>Oct 11 22:14:15 mymachine su[911]: 'su root' failed", now);
        assert_eq!(ty, SourceType::Rfc3164);
        assert_eq!(event.facility, 4);
        assert_eq!(event.severity, 2);
        assert_eq!(event.hostname, "mymachine");
        assert_eq!(event.app_name, "su");
        assert_eq!(event.message, "'su root' failed");
        assert_eq!(event.structured_data["procid"], "911");
        assert_eq!(event.timestamp, at("2023-10-11T22:14:15Z"));
    }

    #[test]
    fn rfc3164_year_rollover() {
        // A December frame received on Jan 1 belongs to the previous year.
        let now = at("2024-01-01T00:10:00Z");
        let (event, _) = parse_payload("<13>Dec 31 23:59:58 host app: tail of last year", now);
        assert_eq!(event.timestamp, at("2023-12-31T23:59:58Z"));
    }

    #[test]
    fn json_frame() {
        let now = at("2023-10-11T22:14:20Z");
        let (event, ty) = parse_payload(
            r#"{"timestamp":"2023-10-11T22:14:15Z","host":"api-1","service":"payments","level":"error","message":"charge failed","order_id":9912}"#,
            now,
        );
        assert_eq!(ty, SourceType::Json);
        assert_eq!(event.hostname, "api-1");
        assert_eq!(event.app_name, "payments");
        assert_eq!(event.severity, 3);
        assert_eq!(event.message, "charge failed");
        assert_eq!(event.structured_data["order_id"], "9912");
    }

    #[test]
    fn raw_fallback_keeps_line() {
        let now = at("2023-10-11T22:14:20Z");
        let (event, ty) = parse_payload("completely unstructured line", now);
        assert_eq!(ty, SourceType::Raw);
        assert_eq!(event.message, "completely unstructured line");
        assert_eq!(event.raw, "completely unstructured line");
        assert_eq!(event.severity, 6);
    }

    #[test]
    fn pri_bounds_respected() {
        let now = at("2023-10-11T22:14:20Z");
        // 192 is out of range, so the frame falls through to raw.
        let (_, ty) = parse_payload("<192>1 - - - - - - x", now);
        assert_eq!(ty, SourceType::Raw);
    }

    #[test]
    fn parsed_severity_and_facility_in_range() {
        let now = at("2023-10-11T22:14:20Z");
        for pri in [0u16, 7, 34, 165, 191] {
            let frame = format!("<{pri}>1 - host app - - - msg");
            let (event, _) = parse_payload(&frame, now);
            assert!(event.severity <= 7);
            assert!(event.facility <= 23);
            assert_eq!(
                event.priority() as u16,
                event.facility as u16 * 8 + event.severity as u16
            );
        }
    }
}

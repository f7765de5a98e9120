use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};

/// Raw payloads larger than this are truncated before storage.
pub const MAX_RAW_BYTES: usize = 64 * 1024;

/// Default logical bucket for events with no routing rule.
pub const DEFAULT_INDEX: &str = "default";

/// A single ingested log event. Immutable once it leaves the ingestion path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub hostname: String,
    pub app_name: String,
    pub message: String,
    /// Syslog severity, 0 (emergency) .. 7 (debug).
    pub severity: u8,
    /// Syslog facility, 0 .. 23.
    pub facility: u8,
    pub source_ip: Option<IpAddr>,
    pub source_port: Option<u16>,
    pub protocol: String,
    pub index_name: String,
    pub raw: String,
    pub structured_data: BTreeMap<String, String>,
}

impl Event {
    /// PRI encoding: facility * 8 + severity.
    pub fn priority(&self) -> u8 {
        self.facility * 8 + self.severity
    }

    /// Enforce storage invariants in place. Returns true when the event
    /// timestamp was rejected and replaced by `received_at` (parse fallback).
    pub fn normalize(&mut self) -> bool {
        if self.index_name.is_empty() {
            self.index_name = DEFAULT_INDEX.to_string();
        }
        if self.raw.len() > MAX_RAW_BYTES {
            let mut cut = MAX_RAW_BYTES;
            while !self.raw.is_char_boundary(cut) {
                cut -= 1;
            }
            self.raw.truncate(cut);
        }
        // Event time must sit within [received_at - 30d, received_at + 24h].
        let too_old = self.timestamp < self.received_at - Duration::days(30);
        let too_new = self.timestamp > self.received_at + Duration::hours(24);
        if too_old || too_new {
            self.timestamp = self.received_at;
            self.structured_data
                .entry("_parse_fallback".to_string())
                .or_insert_with(|| "timestamp_out_of_range".to_string());
            return true;
        }
        false
    }
}

impl Default for Event {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            timestamp: now,
            received_at: now,
            hostname: String::new(),
            app_name: String::new(),
            message: String::new(),
            severity: 6,
            facility: 1,
            source_ip: None,
            source_port: None,
            protocol: String::new(),
            index_name: DEFAULT_INDEX.to_string(),
            raw: String::new(),
            structured_data: BTreeMap::new(),
        }
    }
}

/// Column order of the `events` table. Shared by both dialects; the planner
/// treats anything outside this list as a structured-data path.
pub const EVENT_COLUMNS: &[&str] = &[
    "timestamp",
    "received_at",
    "hostname",
    "app_name",
    "message",
    "severity",
    "facility",
    "priority",
    "source_ip",
    "source_port",
    "protocol",
    "index_name",
    "raw",
    "structured_data",
];

pub fn is_event_column(name: &str) -> bool {
    EVENT_COLUMNS.contains(&name)
}

/// Wire row for ClickHouse RowBinary inserts. Timestamps are epoch millis
/// (DateTime64(3)); IPv4 sources are stored v4-mapped; the Map column binds
/// as key/value pairs.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct EventRow {
    pub timestamp: i64,
    pub received_at: i64,
    pub hostname: String,
    pub app_name: String,
    pub message: String,
    pub severity: u8,
    pub facility: u8,
    pub priority: u8,
    pub source_ip: Option<std::net::Ipv6Addr>,
    pub source_port: Option<u16>,
    pub protocol: String,
    pub index_name: String,
    pub raw: String,
    pub structured_data: Vec<(String, String)>,
}

impl From<&Event> for EventRow {
    fn from(e: &Event) -> Self {
        Self {
            timestamp: e.timestamp.timestamp_millis(),
            received_at: e.received_at.timestamp_millis(),
            hostname: e.hostname.clone(),
            app_name: e.app_name.clone(),
            message: e.message.clone(),
            severity: e.severity,
            facility: e.facility,
            priority: e.priority(),
            source_ip: e.source_ip.map(|ip| match ip {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            }),
            source_port: e.source_port,
            protocol: e.protocol.clone(),
            index_name: e.index_name.clone(),
            raw: e.raw.clone(),
            structured_data: e
                .structured_data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_encoding() {
        let mut e = Event::default();
        e.facility = 4;
        e.severity = 2;
        assert_eq!(e.priority(), 34);
    }

    #[test]
    fn normalize_accepts_in_window_timestamps() {
        let mut e = Event::default();
        e.timestamp = e.received_at - Duration::hours(2);
        assert!(!e.normalize());
        assert!(!e.structured_data.contains_key("_parse_fallback"));
    }

    #[test]
    fn normalize_rejects_future_timestamps() {
        let mut e = Event::default();
        e.timestamp = e.received_at + Duration::days(2);
        assert!(e.normalize());
        assert_eq!(e.timestamp, e.received_at);
        assert_eq!(
            e.structured_data.get("_parse_fallback").map(String::as_str),
            Some("timestamp_out_of_range")
        );
    }

    #[test]
    fn normalize_truncates_oversized_raw() {
        let mut e = Event::default();
        e.raw = "x".repeat(MAX_RAW_BYTES + 100);
        e.normalize();
        assert_eq!(e.raw.len(), MAX_RAW_BYTES);
    }

    #[test]
    fn row_maps_v4_source_ip() {
        let mut e = Event::default();
        e.source_ip = Some("10.0.0.1".parse().unwrap());
        let row = EventRow::from(&e);
        assert_eq!(row.source_ip.unwrap().to_string(), "::ffff:10.0.0.1");
    }
}

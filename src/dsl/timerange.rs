use chrono::{DateTime, Datelike, Duration, DurationRound, TimeZone, Utc};

use crate::dsl::ast::TimeUnit;
use crate::dsl::parser::parse_span_literal;
use crate::error::QueryError;

/// Absolute, fully-resolved query window. Relative forms are materialized
/// against server "now" at planning time so a plan is reproducible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

/// Default lookback when the caller supplies no `earliest`.
pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

pub fn resolve(
    earliest: Option<&str>,
    latest: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TimeRange, QueryError> {
    let latest = match latest {
        Some(s) => parse_instant(s, now)?,
        None => now,
    };
    let earliest = match earliest {
        Some(s) => parse_instant(s, now)?,
        None => now - Duration::hours(DEFAULT_LOOKBACK_HOURS),
    };
    if earliest > latest {
        return Err(QueryError::parse(
            format!("earliest ({earliest}) is after latest ({latest})"),
            1,
            1,
        ));
    }
    Ok(TimeRange { earliest, latest })
}

/// One time bound: `now`, `-Nu[@u]`, a bare duration (meaning "that long
/// ago"), or an ISO-8601 timestamp.
pub fn parse_instant(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, QueryError> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Some(rest) = s.strip_prefix('-') {
        let (dur_part, snap) = match rest.split_once('@') {
            Some((d, snap)) => (d, Some(snap)),
            None => (rest, None),
        };
        let span = parse_relative_unit(dur_part)
            .ok_or_else(|| QueryError::parse(format!("invalid relative time '{s}'"), 1, 1))?;
        let t = now - span;
        return match snap {
            Some(u) => snap_to_unit(t, u)
                .ok_or_else(|| QueryError::parse(format!("invalid snap unit '@{u}'"), 1, 1)),
            None => Ok(t),
        };
    }

    // Bare duration: "24h" means 24 hours ago.
    if let Some(span) = parse_span_literal(s) {
        return Ok(now - Duration::milliseconds(span.as_millis() as i64));
    }

    // Absolute forms.
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()));
    }

    Err(QueryError::parse(format!("invalid time '{s}'"), 1, 1))
}

/// `-Nu` body: digits plus a single unit letter (no `ms` in relative form).
fn parse_relative_unit(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    let n: i64 = digits.parse().ok()?;
    let unit = match unit {
        "s" => TimeUnit::Seconds,
        "m" => TimeUnit::Minutes,
        "h" => TimeUnit::Hours,
        "d" => TimeUnit::Days,
        "w" => TimeUnit::Weeks,
        _ => return None,
    };
    Some(Duration::milliseconds(n * unit.millis() as i64))
}

/// Snap down to the start of the unit. Weeks start on Monday.
fn snap_to_unit(t: DateTime<Utc>, unit: &str) -> Option<DateTime<Utc>> {
    match unit {
        "s" => t.duration_trunc(Duration::seconds(1)).ok(),
        "m" => t.duration_trunc(Duration::minutes(1)).ok(),
        "h" => t.duration_trunc(Duration::hours(1)).ok(),
        "d" => t.duration_trunc(Duration::days(1)).ok(),
        "w" => {
            let day = t.duration_trunc(Duration::days(1)).ok()?;
            Some(day - Duration::days(t.weekday().num_days_from_monday() as i64))
        }
        _ => None,
    }
}

/// Floor a timestamp to its span bucket: `floor(ts / span) * span`.
pub fn bucket_of(t: DateTime<Utc>, span_millis: u64) -> DateTime<Utc> {
    let millis = t.timestamp_millis();
    let span = span_millis as i64;
    let floored = millis.div_euclid(span) * span;
    Utc.timestamp_millis_opt(floored).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn now_keyword() {
        let now = at("2023-10-10T13:55:36Z");
        assert_eq!(parse_instant("now", now).unwrap(), now);
    }

    #[test]
    fn relative_with_snap() {
        let now = at("2023-10-10T13:55:36Z");
        assert_eq!(
            parse_instant("-1h", now).unwrap(),
            at("2023-10-10T12:55:36Z")
        );
        assert_eq!(
            parse_instant("-1h@h", now).unwrap(),
            at("2023-10-10T12:00:00Z")
        );
        assert_eq!(
            parse_instant("-1d@d", now).unwrap(),
            at("2023-10-09T00:00:00Z")
        );
    }

    #[test]
    fn week_snap_lands_on_monday() {
        // 2023-10-10 is a Tuesday.
        let now = at("2023-10-10T13:55:36Z");
        assert_eq!(
            parse_instant("-0w@w", now).unwrap(),
            at("2023-10-09T00:00:00Z")
        );
    }

    #[test]
    fn absolute_iso() {
        let now = at("2023-10-10T13:55:36Z");
        assert_eq!(
            parse_instant("2023-01-02T03:04:05Z", now).unwrap(),
            at("2023-01-02T03:04:05Z")
        );
        assert_eq!(
            parse_instant("2023-01-02", now).unwrap(),
            at("2023-01-02T00:00:00Z")
        );
    }

    #[test]
    fn inverted_range_rejected() {
        let now = at("2023-10-10T13:55:36Z");
        assert!(resolve(Some("now"), Some("-1h"), now).is_err());
    }

    #[test]
    fn bucket_floors() {
        let t = at("2023-10-10T13:55:36Z");
        assert_eq!(bucket_of(t, 3_600_000), at("2023-10-10T13:00:00Z"));
        assert_eq!(bucket_of(t, 300_000), at("2023-10-10T13:55:00Z"));
    }
}

//! Lenient date parsing for feed timestamps.
//!
//! Feeds in the wild rarely follow RFC 822 or RFC 3339 to the letter. Beyond
//! the strict forms this accepts missing seconds, missing or named zones,
//! lowercase or absent day names, two-digit years and bare dates. Anything
//! without an explicit zone is taken as UTC.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// ISO 8601 shapes without a zone, tried in order.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// ISO 8601 shapes with a zone that RFC 3339 rejects.
const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%dT%H:%M%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Parse a feed date. Returns `None` when no known shape matches.
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if s.as_bytes().first().is_some_and(u8::is_ascii_digit) && s.contains('-') {
        if let Some(dt) = parse_iso(s) {
            return Some(dt);
        }
    }
    parse_loose_rfc822(s)
}

/// Unix seconds for a feed date, `now` when it cannot be read.
pub fn parse_date_or(input: Option<&str>, now: DateTime<Utc>) -> i64 {
    input
        .and_then(parse_date)
        .unwrap_or(now)
        .timestamp()
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    for format in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    // A trailing `Z` after a shape RFC 3339 refused, e.g. missing seconds.
    let naive_part = s.strip_suffix('Z').unwrap_or(s);
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(naive_part, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(naive_part, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// `[Day,] DD Mon YYYY [HH:MM[:SS]] [zone]` in any case, with optional
/// commas and a two-digit year.
fn parse_loose_rfc822(s: &str) -> Option<DateTime<Utc>> {
    let cleaned = s.replace(',', " ");
    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens
        .first()
        .is_some_and(|t| t.chars().all(|c| c.is_ascii_alphabetic()) && month_index(t).is_none())
    {
        tokens.remove(0);
    }

    // Accept both `DD Mon` and `Mon DD`.
    let (day, month) = match (tokens.first(), tokens.get(1)) {
        (Some(a), Some(b)) => match (a.parse::<u32>().ok(), month_index(b)) {
            (Some(day), Some(month)) => (day, month),
            _ => (b.parse::<u32>().ok()?, month_index(a)?),
        },
        _ => return None,
    };
    let year = normalize_year(tokens.get(2)?.parse::<i32>().ok()?);
    let date = NaiveDate::from_ymd_opt(year, month, day)?;

    let time = match tokens.get(3) {
        Some(t) if t.contains(':') => parse_clock(t)?,
        _ => NaiveTime::MIN,
    };
    let zone_token = match tokens.get(3) {
        Some(t) if t.contains(':') => tokens.get(4),
        other => other,
    };
    let offset = match zone_token {
        Some(z) => zone_offset(z)?,
        None => FixedOffset::east_opt(0)?,
    };

    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn month_index(token: &str) -> Option<u32> {
    let lower = token.to_ascii_lowercase();
    let prefix = lower.get(..3)?;
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|i| i as u32 + 1)
}

fn normalize_year(year: i32) -> i32 {
    match year {
        0..=49 => 2000 + year,
        50..=99 => 1900 + year,
        _ => year,
    }
}

fn parse_clock(token: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(token, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(token, "%H:%M"))
        .ok()
}

fn zone_offset(token: &str) -> Option<FixedOffset> {
    let hours = match token.to_ascii_uppercase().as_str() {
        "GMT" | "UT" | "UTC" | "Z" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        "CET" => 1,
        "CEST" => 2,
        "BST" => 1,
        "JST" => 9,
        _ => return numeric_offset(token),
    };
    FixedOffset::east_opt(hours * 3600)
}

/// `+hhmm`, `-hh:mm` or `+hh`.
fn numeric_offset(token: &str) -> Option<FixedOffset> {
    let (sign, rest) = match token.as_bytes().first()? {
        b'+' => (1, &token[1..]),
        b'-' => (-1, &token[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (h, m) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ts(s: &str) -> i64 {
        parse_date(s).unwrap_or_else(|| panic!("failed to parse {s:?}")).timestamp()
    }

    const NOON_UTC: i64 = 1_736_942_400; // 2025-01-15T12:00:00Z

    #[test]
    fn test_strict_forms() {
        assert_eq!(ts("Wed, 15 Jan 2025 12:00:00 +0000"), NOON_UTC);
        assert_eq!(ts("2025-01-15T12:00:00Z"), NOON_UTC);
        assert_eq!(ts("2025-01-15T13:00:00+01:00"), NOON_UTC);
    }

    #[test]
    fn test_rfc822_variants() {
        assert_eq!(ts("wed, 15 jan 2025 12:00:00 GMT"), NOON_UTC);
        assert_eq!(ts("Wed, 15 Jan 2025 12:00 GMT"), NOON_UTC);
        assert_eq!(ts("15 Jan 2025 07:00:00 EST"), NOON_UTC);
        assert_eq!(ts("Wed, 15 Jan 25 12:00:00 +0000"), NOON_UTC);
        assert_eq!(ts("Wednesday, 15 January 2025 12:00:00"), NOON_UTC);
        assert_eq!(ts("Jan 15, 2025 12:00:00 UTC"), NOON_UTC);
    }

    #[test]
    fn test_iso_variants() {
        assert_eq!(ts("2025-01-15T12:00:00"), NOON_UTC);
        assert_eq!(ts("2025-01-15T12:00Z"), NOON_UTC);
        assert_eq!(ts("2025-01-15T12:00:00.250Z"), NOON_UTC);
        assert_eq!(ts("2025-01-15T14:00:00+0200"), NOON_UTC);
        assert_eq!(ts("2025-01-15 12:00:00"), NOON_UTC);
        assert_eq!(ts("2025-01-15"), NOON_UTC - 12 * 3600);
    }

    #[test]
    fn test_garbage_is_none() {
        assert!(parse_date("").is_none());
        assert!(parse_date("yesterday-ish").is_none());
        assert!(parse_date("32 Jan 2025").is_none());
    }

    #[test]
    fn test_fallback_to_now() {
        let now = Utc.timestamp_opt(NOON_UTC, 0).unwrap();
        assert_eq!(parse_date_or(Some("not a date"), now), NOON_UTC);
        assert_eq!(parse_date_or(None, now), NOON_UTC);
    }
}

//! Timestamp parsing across feed and sitemap encodings.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// Offset-carrying formats tried after RFC 2822 and RFC 3339.
const ZONED_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%dT%H:%M:%S%.f%z"];

/// Formats without an offset; read as UTC.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a timestamp in any of the encodings seen in feeds and sitemaps.
///
/// Accepts RFC 2822 (RSS `pubDate`), RFC 3339 (Atom), the reduced-precision
/// W3C datetime forms sitemaps use (`YYYY`, `YYYY-MM`, `YYYY-MM-DD`,
/// `YYYY-MM-DDThh:mmTZD`) and offset-less datetimes, which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }

    parse_reduced_date(s).map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

/// `YYYY-MM-DD`, `YYYY-MM` or `YYYY`.
fn parse_reduced_date(s: &str) -> Option<NaiveDate> {
    let mut parts = s.splitn(3, '-');
    let year = parse_part(parts.next()?, 4)?;
    let month = match parts.next() {
        Some(m) => parse_part(m, 2)?,
        None => 1,
    };
    let day = match parts.next() {
        Some(d) => parse_part(d, 2)?,
        None => 1,
    };
    NaiveDate::from_ymd_opt(year as i32, month, day)
}

fn parse_part(part: &str, width: usize) -> Option<u32> {
    if part.len() != width || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().expect("valid date")
    }

    #[test]
    fn feed_encodings() {
        assert_eq!(
            parse_timestamp("Fri, 05 Jan 2024 10:00:00 +0000"),
            Some(utc(2024, 1, 5, 10, 0, 0))
        );
        assert_eq!(
            parse_timestamp("Fri, 05 Jan 2024 11:00:00 GMT"),
            Some(utc(2024, 1, 5, 11, 0, 0))
        );
        assert_eq!(
            parse_timestamp("2024-01-05T12:00:00+02:00"),
            Some(utc(2024, 1, 5, 10, 0, 0))
        );
    }

    #[test]
    fn sitemap_encodings() {
        assert_eq!(parse_timestamp("2024-01-01"), Some(utc(2024, 1, 1, 0, 0, 0)));
        assert_eq!(parse_timestamp("2024-03"), Some(utc(2024, 3, 1, 0, 0, 0)));
        assert_eq!(parse_timestamp("2023"), Some(utc(2023, 1, 1, 0, 0, 0)));
        assert_eq!(
            parse_timestamp("2024-01-01T08:30+01:00"),
            Some(utc(2024, 1, 1, 7, 30, 0))
        );
        assert_eq!(
            parse_timestamp(" 2024-01-01 08:30:00 "),
            Some(utc(2024, 1, 1, 8, 30, 0))
        );
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2024-13-01"), None);
        assert_eq!(parse_timestamp("24-01-01"), None);
    }
}

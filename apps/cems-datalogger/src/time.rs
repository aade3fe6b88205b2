use chrono::{DateTime, FixedOffset, Offset, TimeZone, Timelike, Utc};

/// India Standard Time. The upstream endpoint and the site operators both
/// read wall-clock values in IST.
const SITE_UTC_OFFSET_SECONDS: i32 = 5 * 3600 + 30 * 60;

/// Upstream rejects samples older than this.
pub const BACKDATE_LIMIT_MS: i64 = 7 * 24 * 60 * 60 * 1000;

pub fn site_offset() -> FixedOffset {
    FixedOffset::east_opt(SITE_UTC_OFFSET_SECONDS).unwrap_or_else(|| Utc.fix())
}

pub fn to_site(ts: DateTime<Utc>) -> DateTime<FixedOffset> {
    ts.with_timezone(&site_offset())
}

/// `YYYY-MM-DD HH:MM:SS.mmm` in site time, the format the signature token carries.
pub fn signature_timestamp(now: DateTime<Utc>) -> String {
    to_site(now).format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// `YYYY-MM-DD HH:MM:SS` in site time, used in operator reports.
pub fn report_timestamp(now: DateTime<Utc>) -> String {
    to_site(now).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn iso_site(now: DateTime<Utc>) -> String {
    to_site(now).to_rfc3339()
}

pub fn align_down_ms(ts_ms: i64, interval_seconds: i64) -> i64 {
    let interval_ms = interval_seconds.max(1) * 1000;
    ts_ms.div_euclid(interval_ms) * interval_ms
}

pub fn align_up_ms(ts_ms: i64, interval_seconds: i64) -> i64 {
    let interval_ms = interval_seconds.max(1) * 1000;
    let down = align_down_ms(ts_ms, interval_seconds);
    if down == ts_ms {
        return down;
    }
    down + interval_ms
}

pub fn is_older_than_backdate_limit(aligned_ts_ms: i64, now: DateTime<Utc>) -> bool {
    now.timestamp_millis() - aligned_ts_ms > BACKDATE_LIMIT_MS
}

/// Mirrors the upstream acceptance rules: not too old, not in the future,
/// and sitting exactly on a 15-minute site-time boundary.
pub fn validate_timestamp(ts_ms: i64, now: DateTime<Utc>) -> bool {
    if is_older_than_backdate_limit(ts_ms, now) {
        return false;
    }
    if ts_ms > now.timestamp_millis() {
        return false;
    }
    let Some(utc) = Utc.timestamp_millis_opt(ts_ms).single() else {
        return false;
    };
    let local = to_site(utc);
    local.minute() % 15 == 0 && local.second() == 0 && local.nanosecond() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn align_down_floors_to_quarter_hour() {
        let ts = at("2025-03-10T06:44:59.999Z");
        assert_eq!(
            align_down_ms(ts.timestamp_millis(), 900),
            at("2025-03-10T06:30:00Z").timestamp_millis()
        );
    }

    #[test]
    fn align_up_keeps_exact_boundaries() {
        let exact = at("2025-03-10T06:45:00Z").timestamp_millis();
        assert_eq!(align_up_ms(exact, 900), exact);
        let later = at("2025-03-10T06:45:00.001Z").timestamp_millis();
        assert_eq!(
            align_up_ms(later, 900),
            at("2025-03-10T07:00:00Z").timestamp_millis()
        );
    }

    #[test]
    fn quarter_hour_grid_matches_site_time() {
        // IST is UTC+05:30, so a UTC quarter-hour boundary is also an IST one.
        let ts_ms = align_down_ms(at("2025-03-10T01:07:13Z").timestamp_millis(), 900);
        let local = to_site(Utc.timestamp_millis_opt(ts_ms).unwrap());
        assert_eq!(local.format("%H:%M:%S").to_string(), "06:30:00");
    }

    #[test]
    fn signature_timestamp_uses_millisecond_precision_in_site_time() {
        let ts = at("2025-03-10T01:07:13.042Z");
        assert_eq!(signature_timestamp(ts), "2025-03-10 06:37:13.042");
    }

    #[test]
    fn validate_timestamp_rejects_stale_future_and_unaligned() {
        let now = at("2025-03-10T06:50:00Z");
        assert!(validate_timestamp(at("2025-03-10T06:45:00Z").timestamp_millis(), now));
        assert!(!validate_timestamp(at("2025-03-10T07:00:00Z").timestamp_millis(), now));
        assert!(!validate_timestamp(at("2025-03-10T06:46:00Z").timestamp_millis(), now));
        assert!(!validate_timestamp(at("2025-03-02T06:45:00Z").timestamp_millis(), now));
    }
}

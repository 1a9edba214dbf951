use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, ParseError, Utc};

// Timestamps bound for the analytical store are naive UTC strings.
// Event rows carry millisecond precision; warning and person records
// only keep seconds.
pub const CH_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
pub const CH_SECONDS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_ch_datetime(ts: DateTime<Utc>) -> String {
    ts.format(CH_FORMAT).to_string()
}

pub fn format_ch_seconds(ts: DateTime<Utc>) -> String {
    ts.format(CH_SECONDS_FORMAT).to_string()
}

/// SDKs send timestamps in whatever shape their platform makes easy:
/// RFC3339 with a zone, naive datetimes in space- or T-separated form,
/// occasionally a bare date from backfill tooling. Inputs without a
/// zone are taken as UTC.
pub fn parse_datetime_assuming_utc(input: &str) -> Result<DateTime<Utc>, ParseError> {
    let input = input.trim();

    if let Ok(zoned) = DateTime::parse_from_rfc3339(input) {
        return Ok(zoned.to_utc());
    }

    for naive_format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, naive_format) {
            return Ok(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

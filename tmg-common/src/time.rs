//! Timestamp and MJD utilities

use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};

/// MJD of the Unix epoch (1970-01-01T00:00:00Z)
pub const MJD_UNIX_EPOCH: f64 = 40587.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Fixed-width RFC 3339 form used for stored timestamps.
///
/// Always microseconds and `Z`, so stored values sort lexicographically in
/// time order.
pub fn to_db_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_db_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Bad stored timestamp '{}': {}", value, e)))
}

/// Convert an MJD to a UTC timestamp (microsecond resolution)
pub fn mjd_to_datetime(mjd: f64) -> Option<DateTime<Utc>> {
    if !mjd.is_finite() {
        return None;
    }
    let micros = ((mjd - MJD_UNIX_EPOCH) * SECONDS_PER_DAY * 1e6).round();
    if micros.abs() > i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_micros(micros as i64).single()
}

/// Convert a UTC timestamp to MJD
pub fn datetime_to_mjd(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1e6 / SECONDS_PER_DAY + MJD_UNIX_EPOCH
}

/// Integer MJD day of the given epoch
pub fn mjd_day(mjd: f64) -> i64 {
    mjd.floor() as i64
}

/// Calendar date for an integer MJD day
pub fn mjd_day_to_date(day: i64) -> Option<NaiveDate> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    epoch.checked_add_signed(Duration::days(day - MJD_UNIX_EPOCH as i64))
}

/// Compact UTC timestamp used in backup file names (`20250101T120000_000000Z`)
pub fn file_stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%.6fZ").to_string().replace('.', "_")
}

//! Human-readable "last updated" formatting
//!
//! Provides consistent recency strings for monitoring output.

use chrono::{DateTime, Utc};

/// Recency thresholds (seconds)
const JUST_NOW_MAX: i64 = 3_600; // < 1h
const HOURS_AGO_MAX: i64 = 3 * 3_600; // < 3h
const TODAY_MAX: i64 = 24 * 3_600; // < 24h
const YESTERDAY_MAX: i64 = 48 * 3_600; // < 48h

/// Format how long ago `then` was, relative to `now`.
///
/// Format selection by elapsed time:
/// - `< 1h`: "Updated just now"
/// - `< 3h`: "Updated hours ago"
/// - `< 24h`: "Updated today"
/// - `< 48h`: "Updated yesterday"
/// - otherwise: "Updated on YYYY-MM-DD HH:MM:SS" (UTC)
///
/// A `then` in the future (clock skew between hosts) counts as just now.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use tmg_common::human_time::format_last_updated;
///
/// let now = Utc::now();
/// assert_eq!(format_last_updated(now - Duration::minutes(5), now), "Updated just now");
/// assert_eq!(format_last_updated(now - Duration::hours(30), now), "Updated yesterday");
/// ```
pub fn format_last_updated(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = (now - then).num_seconds();

    if elapsed < JUST_NOW_MAX {
        "Updated just now".to_string()
    } else if elapsed < HOURS_AGO_MAX {
        "Updated hours ago".to_string()
    } else if elapsed < TODAY_MAX {
        "Updated today".to_string()
    } else if elapsed < YESTERDAY_MAX {
        "Updated yesterday".to_string()
    } else {
        format!("Updated on {}", then.format("%Y-%m-%d %H:%M:%S"))
    }
}

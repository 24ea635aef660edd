//! Calendar features derived purely from `unix_ts`.

use chrono::{DateTime, Datelike, SecondsFormat, Timelike};
use chrono_tz::Tz;

use crate::domain::Season;

/// First daytime hour (inclusive).
pub const DAY_START_HOUR: u32 = 6;
/// Last daytime hour (inclusive).
pub const DAY_END_HOUR: u32 = 20;
/// Night begins at this hour...
pub const NIGHT_START_HOUR: u32 = 22;
/// ...and ends before this one.
pub const NIGHT_END_HOUR: u32 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarFeatures {
    pub timestamp: String,
    pub hour: u32,
    /// 0 = Monday
    pub day_of_week: u32,
    pub month: u32,
    pub is_weekend: bool,
    pub is_daytime: bool,
    pub is_night: bool,
    pub season: Season,
}

pub fn is_daytime_hour(hour: u32) -> bool {
    (DAY_START_HOUR..=DAY_END_HOUR).contains(&hour)
}

pub fn is_night_hour(hour: u32) -> bool {
    hour < NIGHT_END_HOUR || hour >= NIGHT_START_HOUR
}

/// Local hour of `unix_ts` in `tz`.
pub fn local_hour(unix_ts: i64, tz: Tz) -> u32 {
    DateTime::from_timestamp(unix_ts, 0)
        .unwrap_or_default()
        .with_timezone(&tz)
        .hour()
}

impl CalendarFeatures {
    pub fn from_unix(unix_ts: i64, tz: Tz) -> Self {
        // Out-of-range timestamps collapse to the epoch.
        let local = DateTime::from_timestamp(unix_ts, 0)
            .unwrap_or_default()
            .with_timezone(&tz);

        let hour = local.hour();
        let day_of_week = local.weekday().num_days_from_monday();
        let month = local.month();

        Self {
            timestamp: local.to_rfc3339_opts(SecondsFormat::Secs, true),
            hour,
            day_of_week,
            month,
            is_weekend: day_of_week >= 5,
            is_daytime: is_daytime_hour(hour),
            is_night: is_night_hour(hour),
            season: Season::from_month(month),
        }
    }
}

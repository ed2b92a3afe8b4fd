//! Reference clock: every "now" comparison happens at a fixed UTC+4 offset,
//! regardless of the server's locale.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};

use crate::model::TimeOfDay;

pub const REFERENCE_UTC_OFFSET_SECS: i32 = 4 * 3600;

pub fn reference_offset() -> FixedOffset {
    FixedOffset::east_opt(REFERENCE_UTC_OFFSET_SECS).expect("UTC+4 is a valid offset")
}

/// Calendar date and minute-resolution time of day as read on the reference clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNow {
    pub date: NaiveDate,
    pub time: TimeOfDay,
}

pub fn reference_now(now: DateTime<Utc>) -> LocalNow {
    let local = now.with_timezone(&reference_offset()).naive_local();
    LocalNow {
        date: local.date(),
        time: TimeOfDay::from_naive(local.time()),
    }
}

/// The UTC instant at which `time` on `date` occurs on the reference clock.
/// `24:00` resolves to midnight of the following day.
pub fn reference_instant(date: NaiveDate, time: TimeOfDay) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(time.minutes()));
    (local - Duration::seconds(i64::from(REFERENCE_UTC_OFFSET_SECS))).and_utc()
}

/// Only the outermost layer should call this; everything below takes `now` as a parameter.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

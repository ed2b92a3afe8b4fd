//! Weekly working-hours schedules.
//!
//! A field's schedule is a JSON object keyed by lowercase weekday name:
//!
//! ```json
//! { "monday": { "open": "09:00", "close": "23:00", "enabled": true }, ... }
//! ```
//!
//! Days missing from the object are closed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Weekday;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use crate::model::TimeOfDay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayHours {
    pub open: TimeOfDay,
    pub close: TimeOfDay,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawDayHours {
    open: String,
    close: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Day entries in document order. A map type would let a repeated key
/// silently replace the earlier one.
struct DayEntries(Vec<(String, RawDayHours)>);

impl<'de> Deserialize<'de> for DayEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = DayEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object keyed by weekday name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<DayEntries, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, RawDayHours>()? {
                    entries.push(entry);
                }
                Ok(DayEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WeeklySchedule {
    days: BTreeMap<String, DayHours>,
}

#[derive(Debug)]
pub enum ScheduleError {
    Json(serde_json::Error),
    UnknownDay(String),
    DuplicateDay(String),
    BadTime { day: String, value: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Json(e) => write!(f, "malformed schedule: {e}"),
            ScheduleError::UnknownDay(d) => write!(f, "unknown weekday: {d}"),
            ScheduleError::DuplicateDay(d) => write!(f, "{d} is listed more than once"),
            ScheduleError::BadTime { day, value } => {
                write!(f, "{day}: invalid time {value:?} (expected HH:MM)")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Sun => "sunday",
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
    }
}

const WEEKDAY_NAMES: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

impl WeeklySchedule {
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let DayEntries(parsed) = serde_json::from_str(raw).map_err(ScheduleError::Json)?;
        let mut days = BTreeMap::new();
        for (name, hours) in parsed {
            let key = name.trim().to_lowercase();
            if !WEEKDAY_NAMES.contains(&key.as_str()) {
                return Err(ScheduleError::UnknownDay(name));
            }
            if days.contains_key(&key) {
                return Err(ScheduleError::DuplicateDay(key));
            }
            let time = |value: &str| {
                value.parse::<TimeOfDay>().map_err(|_| ScheduleError::BadTime {
                    day: key.clone(),
                    value: value.to_string(),
                })
            };
            let open = time(&hours.open)?;
            let close = time(&hours.close)?;
            days.insert(
                key.clone(),
                DayHours {
                    open,
                    close,
                    enabled: hours.enabled,
                },
            );
        }
        Ok(Self { days })
    }

    pub fn day(&self, weekday: Weekday) -> Option<&DayHours> {
        self.days.get(weekday_name(weekday))
    }

    /// The day's bookable window, or `None` when the day is absent, disabled, or empty.
    pub fn window(&self, weekday: Weekday) -> Option<(TimeOfDay, TimeOfDay)> {
        self.day(weekday)
            .filter(|d| d.enabled && d.open < d.close)
            .map(|d| (d.open, d.close))
    }
}

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Wall-clock time of day on the reference clock, in whole minutes since midnight.
///
/// `24:00` is representable so a field can close at the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(MINUTES_PER_DAY);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 || hour > 24 {
            return None;
        }
        let total = hour * 60 + minute;
        (total <= MINUTES_PER_DAY).then_some(Self(total))
    }

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    /// Truncates seconds and below.
    pub fn from_naive(time: NaiveTime) -> Self {
        Self((time.hour() * 60 + time.minute()) as u16)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeParseError(String);

impl fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day {:?} (expected HH:MM)", self.0)
    }
}

impl std::error::Error for TimeParseError {}

impl FromStr for TimeOfDay {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeParseError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        let digits = |part: &str, max_len: usize| {
            if part.is_empty() || part.len() > max_len || !part.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                part.parse::<u16>().ok()
            }
        };
        if m.len() != 2 {
            return Err(err());
        }
        let hour = digits(h, 2).ok_or_else(err)?;
        let minute = digits(m, 2).ok_or_else(err)?;
        TimeOfDay::from_hm(hour, minute).ok_or_else(err)
    }
}

/// Half-open interval `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Span {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: TimeOfDay, end: TimeOfDay) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn whole_day() -> Self {
        Self::new(TimeOfDay::MIDNIGHT, TimeOfDay::END_OF_DAY)
    }

    /// Billable hours: difference of the hour components, minutes ignored.
    pub fn whole_hours(&self) -> i64 {
        i64::from(self.end.hour()) - i64::from(self.start.hour())
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` lies entirely inside `self`. Touching edges count.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A bookable sports field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub id: Ulid,
    pub name: Option<String>,
    pub price_per_hour: Decimal,
    /// Raw weekly schedule document as supplied by the owner. See [`crate::schedule`].
    pub working_hours: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub field_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub total_price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }

    /// The instant the booking starts, read on the reference clock.
    pub fn starts_at(&self) -> DateTime<Utc> {
        clock::reference_instant(self.date, self.span.start)
    }
}

#[derive(Debug, Clone)]
pub struct FieldState {
    pub field: Field,
    /// Every booking of the field, any status, grouped by date and sorted by start.
    days: BTreeMap<NaiveDate, Vec<Booking>>,
    /// Booking id → date, to find a booking's day without scanning.
    index: HashMap<Ulid, NaiveDate>,
}

impl FieldState {
    pub fn new(field: Field) -> Self {
        Self {
            field,
            days: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// Insert booking maintaining sort order by span start.
    pub fn insert_booking(&mut self, booking: Booking) {
        self.index.insert(booking.id, booking.date);
        let day = self.days.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        let date = self.index.get(id)?;
        self.days.get(date)?.iter().find(|b| b.id == *id)
    }

    /// Returns false if the booking is unknown.
    pub fn set_status(&mut self, id: &Ulid, status: BookingStatus) -> bool {
        let Some(date) = self.index.get(id) else {
            return false;
        };
        match self
            .days
            .get_mut(date)
            .and_then(|day| day.iter_mut().find(|b| b.id == *id))
        {
            Some(booking) => {
                booking.status = status;
                true
            }
            None => false,
        }
    }

    /// All bookings on `date`, any status.
    pub fn day(&self, date: &NaiveDate) -> &[Booking] {
        self.days.get(date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn confirmed_on(&self, date: &NaiveDate) -> Vec<Booking> {
        self.day(date)
            .iter()
            .filter(|b| b.is_confirmed())
            .cloned()
            .collect()
    }

    pub fn all_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flatten()
    }

    pub fn booking_count(&self) -> usize {
        self.index.len()
    }

    pub fn has_confirmed(&self) -> bool {
        self.all_bookings().any(Booking::is_confirmed)
    }
}

/// A reservation request that has not been admitted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub field_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

impl Candidate {
    pub fn new(field_id: Ulid, date: NaiveDate, span: Span) -> Self {
        Self { field_id, date, span }
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FieldCreated {
        id: Ulid,
        name: Option<String>,
        price_per_hour: Decimal,
        working_hours: Option<String>,
    },
    FieldUpdated {
        id: Ulid,
        name: Option<String>,
        price_per_hour: Decimal,
        working_hours: Option<String>,
    },
    FieldDeleted {
        id: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        field_id: Ulid,
        user_id: Ulid,
        date: NaiveDate,
        span: Span,
        total_price: Decimal,
        created_at: DateTime<Utc>,
    },
    BookingCancelled {
        id: Ulid,
        field_id: Ulid,
    },
}

impl Event {
    pub fn field_id(&self) -> Ulid {
        match self {
            Event::FieldCreated { id, .. }
            | Event::FieldUpdated { id, .. }
            | Event::FieldDeleted { id } => *id,
            Event::BookingConfirmed { field_id, .. } | Event::BookingCancelled { field_id, .. } => {
                *field_id
            }
        }
    }
}

use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use tracing::warn;
use ulid::Ulid;

use crate::clock;
use crate::model::*;
use crate::schedule::WeeklySchedule;

use super::conflict::find_conflict;

// ── Admissibility ────────────────────────────────────────────────

/// Why a candidate reservation was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    FieldNotFound,
    PastTime,
    OutsideWorkingHours,
    /// Carries the first confirmed booking found overlapping the candidate.
    Conflict(Ulid),
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::FieldNotFound => "FIELD_NOT_FOUND",
            RejectReason::PastTime => "PAST_TIME",
            RejectReason::OutsideWorkingHours => "OUTSIDE_WORKING_HOURS",
            RejectReason::Conflict(_) => "CONFLICT",
        }
    }

    /// Status a web handler answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            RejectReason::FieldNotFound => 404,
            RejectReason::PastTime
            | RejectReason::OutsideWorkingHours
            | RejectReason::Conflict(_) => 400,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::FieldNotFound => write!(f, "FIELD_NOT_FOUND: field does not exist"),
            RejectReason::PastTime => write!(f, "PAST_TIME: cannot book a time in the past"),
            RejectReason::OutsideWorkingHours => {
                write!(f, "OUTSIDE_WORKING_HOURS: field is closed at the requested time")
            }
            RejectReason::Conflict(id) => {
                write!(f, "CONFLICT: overlaps confirmed booking {id}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit { price: Decimal },
    Reject(RejectReason),
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit { .. })
    }
}

/// Decide whether `candidate` may become a confirmed booking.
///
/// Checks run in order and the first failure wins: existence, past-time
/// cutoff, working hours, conflicts. On success the price is
/// `price_per_hour × whole hours`. Pure: `now` is the only notion of time
/// and nothing is written.
pub fn evaluate(
    candidate: &Candidate,
    field: Option<&Field>,
    existing: &[Booking],
    now: DateTime<Utc>,
) -> Decision {
    match admit(candidate, field, existing, now) {
        Ok(price) => Decision::Admit { price },
        Err(reason) => Decision::Reject(reason),
    }
}

fn admit(
    candidate: &Candidate,
    field: Option<&Field>,
    existing: &[Booking],
    now: DateTime<Utc>,
) -> Result<Decimal, RejectReason> {
    let field = field.ok_or(RejectReason::FieldNotFound)?;
    debug_assert_eq!(field.id, candidate.field_id);

    check_not_past(candidate, now)?;
    check_working_hours(field, candidate)?;
    if let Some(existing) = find_conflict(candidate, existing) {
        return Err(RejectReason::Conflict(existing.id));
    }
    Ok(price_for(field, &candidate.span))
}

pub(crate) fn check_not_past(candidate: &Candidate, now: DateTime<Utc>) -> Result<(), RejectReason> {
    let today = clock::reference_now(now);
    if candidate.date < today.date
        || (candidate.date == today.date && candidate.span.start <= today.time)
    {
        return Err(RejectReason::PastTime);
    }
    Ok(())
}

pub(crate) fn check_working_hours(field: &Field, candidate: &Candidate) -> Result<(), RejectReason> {
    let Some(raw) = field.working_hours.as_deref() else {
        return Ok(());
    };
    let schedule = match WeeklySchedule::parse(raw) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(field_id = %field.id, "skipping working-hours check: {e}");
            return Ok(());
        }
    };
    let inside = schedule
        .window(candidate.date.weekday())
        .is_some_and(|(open, close)| Span::new(open, close).contains_span(&candidate.span));
    if inside {
        Ok(())
    } else {
        Err(RejectReason::OutsideWorkingHours)
    }
}

pub fn price_for(field: &Field, span: &Span) -> Decimal {
    field.price_per_hour * Decimal::from(span.whole_hours())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn field(price: i64, working_hours: Option<&str>) -> Field {
        Field {
            id: Ulid::new(),
            name: Some("Pitch".into()),
            price_per_hour: Decimal::from(price),
            working_hours: working_hours.map(str::to_string),
        }
    }

    // Monday 2026-10-19, 12:00 at UTC+4.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn candidate(f: &Field, date: NaiveDate, start: &str, end: &str) -> Candidate {
        Candidate::new(f.id, date, Span::new(t(start), t(end)))
    }

    #[test]
    fn missing_field_wins_over_everything() {
        let f = field(50, None);
        let yesterday = today().pred_opt().unwrap();
        let c = candidate(&f, yesterday, "10:00", "11:00");
        assert_eq!(
            evaluate(&c, None, &[], now()),
            Decision::Reject(RejectReason::FieldNotFound)
        );
    }

    #[test]
    fn past_time_is_checked_before_hours() {
        let f = field(50, Some("{}"));
        let yesterday = today().pred_opt().unwrap();
        let c = candidate(&f, yesterday, "18:00", "20:00");
        assert_eq!(
            evaluate(&c, Some(&f), &[], now()),
            Decision::Reject(RejectReason::PastTime)
        );
    }

    #[test]
    fn today_after_now_is_fine() {
        let f = field(50, None);
        let c = candidate(&f, today(), "12:01", "13:00");
        assert!(evaluate(&c, Some(&f), &[], now()).is_admit());
    }

    #[test]
    fn today_earlier_start_is_past() {
        let f = field(50, None);
        let c = candidate(&f, today(), "11:00", "13:00");
        assert_eq!(
            evaluate(&c, Some(&f), &[], now()),
            Decision::Reject(RejectReason::PastTime)
        );
    }

    #[test]
    fn hours_are_checked_before_conflicts() {
        let f = field(50, Some(r#"{"tuesday": {"open": "09:00", "close": "17:00", "enabled": true}}"#));
        let tomorrow = today().succ_opt().unwrap();
        let c = candidate(&f, tomorrow, "16:00", "18:00");
        assert_eq!(
            evaluate(&c, Some(&f), &[], now()),
            Decision::Reject(RejectReason::OutsideWorkingHours)
        );
    }

    #[test]
    fn booking_exactly_at_open_and_close_is_inside() {
        let f = field(50, Some(r#"{"tuesday": {"open": "09:00", "close": "17:00", "enabled": true}}"#));
        let tomorrow = today().succ_opt().unwrap();
        let c = candidate(&f, tomorrow, "09:00", "17:00");
        assert_eq!(
            evaluate(&c, Some(&f), &[], now()),
            Decision::Admit { price: Decimal::from(400) }
        );
    }

    #[test]
    fn unparseable_schedule_fails_open() {
        let f = field(50, Some("{ not json"));
        let tomorrow = today().succ_opt().unwrap();
        let c = candidate(&f, tomorrow, "03:00", "04:00");
        assert!(evaluate(&c, Some(&f), &[], now()).is_admit());
    }

    #[test]
    fn price_is_not_prorated() {
        let f = field(50, None);
        let tomorrow = today().succ_opt().unwrap();
        let c = candidate(&f, tomorrow, "18:30", "20:00");
        assert_eq!(
            evaluate(&c, Some(&f), &[], now()),
            Decision::Admit { price: Decimal::from(100) }
        );
    }

    #[test]
    fn decimal_price_multiplies_exactly() {
        let mut f = field(0, None);
        f.price_per_hour = Decimal::new(4550, 2); // 45.50
        let tomorrow = today().succ_opt().unwrap();
        let c = candidate(&f, tomorrow, "18:00", "21:00");
        assert_eq!(
            evaluate(&c, Some(&f), &[], now()),
            Decision::Admit { price: Decimal::new(13650, 2) }
        );
    }

    #[test]
    fn reason_codes_and_statuses() {
        assert_eq!(RejectReason::FieldNotFound.http_status(), 404);
        assert_eq!(RejectReason::PastTime.http_status(), 400);
        assert_eq!(RejectReason::OutsideWorkingHours.http_status(), 400);
        assert_eq!(RejectReason::Conflict(Ulid::new()).http_status(), 400);
        assert_eq!(RejectReason::Conflict(Ulid::new()).code(), "CONFLICT");
        assert_eq!(RejectReason::OutsideWorkingHours.code(), "OUTSIDE_WORKING_HOURS");
    }
}

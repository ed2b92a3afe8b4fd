use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tracing::warn;

use crate::clock;
use crate::model::*;
use crate::schedule::WeeklySchedule;

// ── Availability ──────────────────────────────────────────────────

/// Bookable windows of `field` on `date`.
///
/// Base window: the day's working hours (whole day without a schedule or
/// with an unreadable one; nothing on a closed day). Confirmed bookings are
/// subtracted, and on the current reference-clock day so is everything up to
/// and including the current minute.
pub fn free_spans(
    field: &Field,
    date: NaiveDate,
    existing: &[Booking],
    now: DateTime<Utc>,
) -> Vec<Span> {
    let Some(base) = working_window(field, date) else {
        return Vec::new();
    };

    let today = clock::reference_now(now);
    if date < today.date {
        return Vec::new();
    }

    let mut taken: Vec<Span> = existing
        .iter()
        .filter(|b| b.is_confirmed() && b.field_id == field.id && b.date == date)
        .map(|b| b.span)
        .collect();
    if date == today.date {
        // A booking may start no earlier than the minute after "now".
        if let Some(next) = TimeOfDay::from_minutes(today.time.minutes() + 1) {
            taken.push(Span::new(TimeOfDay::MIDNIGHT, next));
        } else {
            return Vec::new();
        }
    }
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);

    subtract_intervals(&[base], &taken)
}

fn working_window(field: &Field, date: NaiveDate) -> Option<Span> {
    let Some(raw) = field.working_hours.as_deref() else {
        return Some(Span::whole_day());
    };
    match WeeklySchedule::parse(raw) {
        Ok(schedule) => schedule
            .window(date.weekday())
            .map(|(open, close)| Span::new(open, close)),
        Err(e) => {
            warn!(field_id = %field.id, "ignoring unreadable working hours: {e}");
            Some(Span::whole_day())
        }
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use ulid::Ulid;

    fn s(start: &str, end: &str) -> Span {
        Span::new(start.parse().unwrap(), end.parse().unwrap())
    }

    fn field(working_hours: Option<&str>) -> Field {
        Field {
            id: Ulid::new(),
            name: None,
            price_per_hour: Decimal::from(50),
            working_hours: working_hours.map(str::to_string),
        }
    }

    fn booking(f: &Field, date: NaiveDate, span: Span) -> Booking {
        Booking {
            id: Ulid::new(),
            field_id: f.id,
            user_id: Ulid::new(),
            date,
            span,
            status: BookingStatus::Confirmed,
            total_price: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    // Monday 2026-10-19 12:00 at UTC+4.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()
    }

    fn tuesday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
    }

    #[test]
    fn subtract_no_overlap() {
        let base = vec![s("01:00", "02:00"), s("03:00", "04:00")];
        let remove = vec![s("02:00", "03:00")];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[s("10:00", "12:00")], &[s("09:00", "13:00")]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_multiple_punches() {
        let result = subtract_intervals(
            &[s("08:00", "23:00")],
            &[s("09:00", "10:00"), s("12:00", "14:00"), s("22:00", "23:00")],
        );
        assert_eq!(
            result,
            vec![s("08:00", "09:00"), s("10:00", "12:00"), s("14:00", "22:00")]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let merged = merge_overlapping(&[s("10:00", "11:00"), s("11:00", "12:00"), s("13:00", "14:00")]);
        assert_eq!(merged, vec![s("10:00", "12:00"), s("13:00", "14:00")]);
    }

    #[test]
    fn no_schedule_means_whole_day_minus_bookings() {
        let f = field(None);
        let rows = vec![booking(&f, tuesday(), s("18:00", "20:00"))];
        assert_eq!(
            free_spans(&f, tuesday(), &rows, now()),
            vec![s("00:00", "18:00"), s("20:00", "24:00")]
        );
    }

    #[test]
    fn schedule_bounds_the_day() {
        let f = field(Some(r#"{"tuesday": {"open": "09:00", "close": "22:00", "enabled": true}}"#));
        let rows = vec![booking(&f, tuesday(), s("08:00", "10:00"))];
        assert_eq!(free_spans(&f, tuesday(), &rows, now()), vec![s("10:00", "22:00")]);
    }

    #[test]
    fn closed_day_has_nothing() {
        let f = field(Some(r#"{"tuesday": {"open": "09:00", "close": "22:00", "enabled": false}}"#));
        assert!(free_spans(&f, tuesday(), &[], now()).is_empty());
    }

    #[test]
    fn today_starts_after_current_minute() {
        let f = field(None);
        let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(free_spans(&f, monday, &[], now()), vec![s("12:01", "24:00")]);
    }

    #[test]
    fn past_days_have_nothing() {
        let f = field(None);
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert!(free_spans(&f, sunday, &[], now()).is_empty());
    }
}

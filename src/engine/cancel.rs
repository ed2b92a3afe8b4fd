use chrono::{DateTime, Duration, Utc};

use crate::model::Booking;

/// Minimum notice, in hours, for cancelling a confirmed booking.
pub const CANCELLATION_NOTICE_HOURS: i64 = 4;

/// A confirmed booking may be cancelled only while its start is at least
/// [`CANCELLATION_NOTICE_HOURS`] away on the reference clock.
pub fn can_cancel(booking: &Booking, now: DateTime<Utc>) -> bool {
    booking.is_confirmed() && now + Duration::hours(CANCELLATION_NOTICE_HOURS) <= booking.starts_at()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::model::*;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use ulid::Ulid;

    fn booking_starting_at(start: DateTime<Utc>) -> Booking {
        let local = clock::reference_now(start);
        Booking {
            id: Ulid::new(),
            field_id: Ulid::new(),
            user_id: Ulid::new(),
            date: local.date,
            span: Span::new(local.time, TimeOfDay::END_OF_DAY),
            status: BookingStatus::Confirmed,
            total_price: Decimal::from(50),
            created_at: start,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()
    }

    #[test]
    fn three_hours_ahead_is_too_late() {
        let b = booking_starting_at(now() + Duration::hours(3));
        assert!(!can_cancel(&b, now()));
    }

    #[test]
    fn five_hours_ahead_is_fine() {
        let b = booking_starting_at(now() + Duration::hours(5));
        assert!(can_cancel(&b, now()));
    }

    #[test]
    fn exactly_four_hours_ahead_is_fine() {
        let b = booking_starting_at(now() + Duration::hours(4));
        assert!(can_cancel(&b, now()));
    }

    #[test]
    fn start_is_read_on_reference_clock() {
        // 18:00 at UTC+4 is 14:00 UTC; at 10:30 UTC there are 3.5 hours left.
        let b = Booking {
            date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            span: Span::new("18:00".parse().unwrap(), "20:00".parse().unwrap()),
            ..booking_starting_at(now())
        };
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 10, 30, 0).unwrap();
        assert!(!can_cancel(&b, at));
        let earlier = Utc.with_ymd_and_hms(2026, 10, 19, 9, 59, 0).unwrap();
        assert!(can_cancel(&b, earlier));
    }

    #[test]
    fn cancelled_booking_cannot_be_cancelled_again() {
        let mut b = booking_starting_at(now() + Duration::hours(48));
        b.status = BookingStatus::Cancelled;
        assert!(!can_cancel(&b, now()));
    }
}

use ulid::Ulid;

use super::admission::RejectReason;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The admissibility engine turned the candidate down.
    Rejected(RejectReason),
    /// Start time not strictly before end time.
    InvalidTimeRange,
    InvalidSchedule(String),
    InvalidPrice(String),
    NotCancellable(Ulid),
    AlreadyCancelled(Ulid),
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Rejected(reason) => write!(f, "booking rejected: {reason}"),
            EngineError::InvalidTimeRange => write!(f, "start time must be before end time"),
            EngineError::InvalidSchedule(e) => write!(f, "invalid working hours: {e}"),
            EngineError::InvalidPrice(e) => write!(f, "invalid price: {e}"),
            EngineError::NotCancellable(id) => write!(
                f,
                "booking {id} starts in less than {} hours and can no longer be cancelled",
                super::cancel::CANCELLATION_NOTICE_HOURS
            ),
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete field {id}: has confirmed bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

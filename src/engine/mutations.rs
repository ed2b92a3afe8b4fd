use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tokio::sync::{RwLock, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ADMISSIONS_TOTAL, CANCELLATIONS_TOTAL};
use crate::schedule::WeeklySchedule;

use super::admission::{Decision, RejectReason, evaluate};
use super::cancel::can_cancel;
use super::{Engine, EngineError, SharedFieldState, WalCommand};

fn validate_field(
    name: &Option<String>,
    price_per_hour: &Decimal,
    working_hours: &Option<String>,
) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("field name too long"));
    }
    if *price_per_hour <= Decimal::ZERO {
        return Err(EngineError::InvalidPrice(format!(
            "price per hour must be positive, got {price_per_hour}"
        )));
    }
    if let Some(raw) = working_hours {
        if raw.len() > MAX_SCHEDULE_LEN {
            return Err(EngineError::LimitExceeded("working hours document too long"));
        }
        WeeklySchedule::parse(raw).map_err(|e| EngineError::InvalidSchedule(e.to_string()))?;
    }
    Ok(())
}

/// Booking on a field that does not exist (or stopped existing while we
/// waited for its lock).
fn reject_missing_field(candidate: &Candidate, now: DateTime<Utc>) -> EngineError {
    let decision = evaluate(candidate, None, &[], now);
    record_decision(&decision);
    EngineError::Rejected(RejectReason::FieldNotFound)
}

fn record_decision(decision: &Decision) {
    match decision {
        Decision::Admit { .. } => {
            metrics::counter!(ADMISSIONS_TOTAL, "outcome" => "admit", "reason" => "").increment(1);
        }
        Decision::Reject(reason) => {
            metrics::counter!(ADMISSIONS_TOTAL, "outcome" => "reject", "reason" => reason.code())
                .increment(1);
        }
    }
}

impl Engine {
    pub async fn create_field(
        &self,
        id: Ulid,
        name: Option<String>,
        price_per_hour: Decimal,
        working_hours: Option<String>,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        if self.state.len() >= MAX_FIELDS {
            return Err(EngineError::LimitExceeded("too many fields"));
        }
        validate_field(&name, &price_per_hour, &working_hours)?;

        let event = Event::FieldCreated {
            id,
            name: name.clone(),
            price_per_hour,
            working_hours: working_hours.clone(),
        };
        let fs: SharedFieldState = Arc::new(RwLock::new(FieldState::new(Field {
            id,
            name,
            price_per_hour,
            working_hours,
        })));
        // Claim the id with the new field already locked, so nothing can book
        // on it before its creation is durable.
        let _guard = fs.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(fs.clone());
            }
        }

        if let Err(e) = self.wal_append(&event).await {
            self.state.remove_if(&id, |_, v| Arc::ptr_eq(v, &fs));
            return Err(e);
        }
        Ok(())
    }

    /// Replace a field's name, price and schedule. Existing bookings keep
    /// the price they were admitted at.
    pub async fn update_field(
        &self,
        id: Ulid,
        name: Option<String>,
        price_per_hour: Decimal,
        working_hours: Option<String>,
    ) -> Result<(), EngineError> {
        validate_field(&name, &price_per_hour, &working_hours)?;
        let _gate = self.compaction_gate.read().await;
        let fs = self
            .get_field_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = fs.write().await;
        if !self.is_registered(&id, &fs) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::FieldUpdated {
            id,
            name,
            price_per_hour,
            working_hours,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn delete_field(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let fs = self
            .get_field_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = fs.write().await;
        if !self.is_registered(&id, &fs) {
            return Err(EngineError::NotFound(id));
        }
        if guard.has_confirmed() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::FieldDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove_if(&id, |_, v| Arc::ptr_eq(v, &fs));
        self.forget_bookings(&guard);
        Ok(())
    }

    /// Evaluate `candidate` and, when admitted, insert it as a confirmed booking.
    ///
    /// The field's write lock is held from reading its bookings until the new
    /// row is applied, so two overlapping requests cannot both be admitted.
    /// The booking id is claimed up front and released again if the booking
    /// is not made.
    pub async fn book(
        &self,
        id: Ulid,
        user_id: Ulid,
        candidate: Candidate,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        let _gate = self.compaction_gate.read().await;
        match self.booking_to_field.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(candidate.field_id);
            }
        }

        let result = self.book_claimed(id, user_id, candidate, now).await;
        if result.is_err() {
            self.booking_to_field.remove(&id);
        }
        result
    }

    async fn book_claimed(
        &self,
        id: Ulid,
        user_id: Ulid,
        candidate: Candidate,
        now: DateTime<Utc>,
    ) -> Result<Booking, EngineError> {
        let Some(fs) = self.get_field_state(&candidate.field_id) else {
            return Err(reject_missing_field(&candidate, now));
        };
        let mut guard = fs.write().await;
        if !self.is_registered(&candidate.field_id, &fs) {
            return Err(reject_missing_field(&candidate, now));
        }
        if guard.booking_count() >= MAX_BOOKINGS_PER_FIELD {
            return Err(EngineError::LimitExceeded("too many bookings on field"));
        }

        let decision = evaluate(&candidate, Some(&guard.field), guard.day(&candidate.date), now);
        record_decision(&decision);
        let total_price = match decision {
            Decision::Admit { price } => price,
            Decision::Reject(reason) => {
                debug!(
                    field_id = %candidate.field_id,
                    date = %candidate.date,
                    span = %candidate.span,
                    "rejected: {reason}"
                );
                return Err(EngineError::Rejected(reason));
            }
        };

        let event = Event::BookingConfirmed {
            id,
            field_id: candidate.field_id,
            user_id,
            date: candidate.date,
            span: candidate.span,
            total_price,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(booking_id = %id, field_id = %candidate.field_id, %total_price, "booking confirmed");

        guard
            .booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel_booking(&self, id: Ulid, now: DateTime<Utc>) -> Result<Booking, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard
            .booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !booking.is_confirmed() {
            metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => "already_cancelled").increment(1);
            return Err(EngineError::AlreadyCancelled(id));
        }
        if !can_cancel(&booking, now) {
            metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => "too_late").increment(1);
            return Err(EngineError::NotCancellable(id));
        }

        let event = Event::BookingCancelled {
            id,
            field_id: booking.field_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => "cancelled").increment(1);

        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..booking
        })
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// No mutation runs between taking the snapshot and swapping the file, so
    /// every event acknowledged before the swap is in the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let field_states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();

        for fs in field_states {
            let guard = fs.read().await;
            let field = &guard.field;
            events.push(Event::FieldCreated {
                id: field.id,
                name: field.name.clone(),
                price_per_hour: field.price_per_hour,
                working_hours: field.working_hours.clone(),
            });
            for b in guard.all_bookings() {
                events.push(Event::BookingConfirmed {
                    id: b.id,
                    field_id: b.field_id,
                    user_id: b.user_id,
                    date: b.date,
                    span: b.span,
                    total_price: b.total_price,
                    created_at: b.created_at,
                });
                if b.status == BookingStatus::Cancelled {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        field_id: b.field_id,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use crate::model::*;

use super::admission::{self, Decision, RejectReason};
use super::availability::free_spans;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_field(&self, id: &Ulid) -> Option<Field> {
        let fs = self.get_field_state(id)?;
        let guard = fs.read().await;
        Some(guard.field.clone())
    }

    /// Every field, ordered by id (creation order for ULIDs).
    pub async fn list_fields(&self) -> Vec<Field> {
        let field_states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut fields = Vec::with_capacity(field_states.len());
        for fs in field_states {
            fields.push(fs.read().await.field.clone());
        }
        fields.sort_by_key(|f| f.id);
        fields
    }

    /// Confirmed bookings of a field on one date, by start time.
    pub async fn confirmed_bookings(
        &self,
        field_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        let fs = self
            .get_field_state(&field_id)
            .ok_or(EngineError::NotFound(field_id))?;
        let guard = fs.read().await;
        Ok(guard.confirmed_on(&date))
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let field_id = self.get_field_for_booking(id)?;
        let fs = self.get_field_state(&field_id)?;
        let guard = fs.read().await;
        guard.booking(id).cloned()
    }

    /// All bookings a user made, any status, by date then start time.
    pub async fn bookings_for_user(&self, user_id: &Ulid) -> Vec<Booking> {
        let ids: Vec<Ulid> = self
            .user_bookings
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(booking) = self.get_booking(&id).await {
                out.push(booking);
            }
        }
        out.sort_by_key(|b| (b.date, b.span.start));
        out
    }

    /// All bookings of a field, any status, by date then start time.
    pub async fn bookings_for_field(&self, field_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let fs = self
            .get_field_state(&field_id)
            .ok_or(EngineError::NotFound(field_id))?;
        let guard = fs.read().await;
        Ok(guard.all_bookings().cloned().collect())
    }

    /// Run the admissibility checks without booking anything.
    pub async fn evaluate(&self, candidate: &Candidate, now: DateTime<Utc>) -> Decision {
        let Some(fs) = self.get_field_state(&candidate.field_id) else {
            return Decision::Reject(RejectReason::FieldNotFound);
        };
        let guard = fs.read().await;
        admission::evaluate(candidate, Some(&guard.field), guard.day(&candidate.date), now)
    }

    pub async fn compute_availability(
        &self,
        field_id: Ulid,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Vec<Span>, EngineError> {
        let fs = self
            .get_field_state(&field_id)
            .ok_or(EngineError::NotFound(field_id))?;
        let guard = fs.read().await;
        Ok(free_spans(&guard.field, date, guard.day(&date), now))
    }
}

mod admission;
mod availability;
mod cancel;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use admission::{Decision, RejectReason, evaluate, price_for};
pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use cancel::{CANCELLATION_NOTICE_HOURS, can_cancel};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedFieldState = Arc<RwLock<FieldState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, write the
/// batch with a single fsync, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Commit what we have before compaction or stats see the WAL.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// In-memory store of fields and their bookings, made durable by the WAL.
///
/// Each field sits behind its own lock; anything that must check-then-write
/// (booking, cancelling) holds the field's write lock across both steps.
/// Every mutation also holds `compaction_gate` shared from its first check
/// until its event is applied; compaction takes it exclusively.
pub struct Engine {
    pub state: DashMap<Ulid, SharedFieldState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) compaction_gate: RwLock<()>,
    /// Reverse lookup: booking id → field id
    pub(super) booking_to_field: DashMap<Ulid, Ulid>,
    /// User id → ids of every booking they made.
    pub(super) user_bookings: DashMap<Ulid, Vec<Ulid>>,
}

/// Apply an event directly to a FieldState. Caller holds the lock.
fn apply_to_field(
    fs: &mut FieldState,
    event: &Event,
    booking_map: &DashMap<Ulid, Ulid>,
    user_map: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::FieldUpdated {
            name,
            price_per_hour,
            working_hours,
            ..
        } => {
            fs.field.name = name.clone();
            fs.field.price_per_hour = *price_per_hour;
            fs.field.working_hours = working_hours.clone();
        }
        Event::BookingConfirmed {
            id,
            field_id,
            user_id,
            date,
            span,
            total_price,
            created_at,
        } => {
            fs.insert_booking(Booking {
                id: *id,
                field_id: *field_id,
                user_id: *user_id,
                date: *date,
                span: *span,
                status: BookingStatus::Confirmed,
                total_price: *total_price,
                created_at: *created_at,
            });
            booking_map.insert(*id, *field_id);
            user_map.entry(*user_id).or_default().push(*id);
        }
        Event::BookingCancelled { id, .. } => {
            fs.set_status(id, BookingStatus::Cancelled);
        }
        // FieldCreated/Deleted are handled at the DashMap level, not here
        Event::FieldCreated { .. } | Event::FieldDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            booking_to_field: DashMap::new(),
            user_bookings: DashMap::new(),
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never block here; this may run inside a runtime.
        for event in &events {
            match event {
                Event::FieldCreated {
                    id,
                    name,
                    price_per_hour,
                    working_hours,
                } => {
                    let field = Field {
                        id: *id,
                        name: name.clone(),
                        price_per_hour: *price_per_hour,
                        working_hours: working_hours.clone(),
                    };
                    engine
                        .state
                        .insert(*id, Arc::new(RwLock::new(FieldState::new(field))));
                }
                Event::FieldDeleted { id } => {
                    if let Some((_, fs)) = engine.state.remove(id) {
                        let guard = fs.try_read().expect("replay: uncontended read");
                        engine.forget_bookings(&guard);
                    }
                }
                other => {
                    if let Some(entry) = engine.state.get(&other.field_id()) {
                        let fs = entry.clone();
                        let mut guard = fs.try_write().expect("replay: uncontended write");
                        apply_to_field(
                            &mut guard,
                            other,
                            &engine.booking_to_field,
                            &engine.user_bookings,
                        );
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_field_state(&self, id: &Ulid) -> Option<SharedFieldState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_field_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_field.get(booking_id).map(|e| *e.value())
    }

    /// False once `fs` has been deleted (or replaced) under `field_id`.
    /// Checked after taking a field lock, since the field may have gone
    /// while we waited.
    pub(super) fn is_registered(&self, field_id: &Ulid, fs: &SharedFieldState) -> bool {
        self.state
            .get(field_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), fs))
    }

    /// WAL-append then apply, so a failed write leaves memory untouched.
    pub(super) async fn persist_and_apply(
        &self,
        fs: &mut FieldState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_field(fs, event, &self.booking_to_field, &self.user_bookings);
        Ok(())
    }

    /// Lookup booking → field, get the field, acquire its write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<FieldState>, EngineError> {
        let field_id = self
            .get_field_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let fs = self
            .get_field_state(&field_id)
            .ok_or(EngineError::NotFound(field_id))?;
        let guard = fs.clone().write_owned().await;
        if !self.is_registered(&field_id, &fs) {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok(guard)
    }

    /// Drop index entries for every booking of a removed field.
    pub(super) fn forget_bookings(&self, fs: &FieldState) {
        for booking in fs.all_bookings() {
            self.booking_to_field.remove(&booking.id);
            if let Some(mut ids) = self.user_bookings.get_mut(&booking.user_id) {
                ids.retain(|id| *id != booking.id);
            }
        }
    }
}

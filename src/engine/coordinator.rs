use std::sync::Arc;

use chrono::{NaiveTime, TimeDelta};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_change_window, check_free, check_within};
use super::{Engine, EngineError, ErrorClass, SlotLedger};

/// Count the outcome and log it at a level matching its class.
fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
    if let Err(e) = result {
        match e.class() {
            ErrorClass::Internal => error!(op, "{e}"),
            ErrorClass::Contention => warn!(op, "{e}"),
            _ => debug!(op, "{e}"),
        }
    }
}

/// Run the exclusive section on its own task: a caller that goes away
/// mid-request cannot cancel it between the WAL write and the apply.
async fn detached<T, F>(fut: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| EngineError::InvariantViolation(format!("booking task aborted: {e}")))?
}

impl Engine {
    /// Atomically convert `range` of a slot into a confirmed booking.
    pub async fn book(
        self: &Arc<Self>,
        actor: Actor,
        slot_id: SlotId,
        range: TimeRange,
    ) -> Result<BookingId, EngineError> {
        let result = self.book_inner(actor, slot_id, range).await;
        record_outcome("book", &result);
        result
    }

    async fn book_inner(
        self: &Arc<Self>,
        actor: Actor,
        slot_id: SlotId,
        range: TimeRange,
    ) -> Result<BookingId, EngineError> {
        if actor.role != Role::Requester {
            return Err(EngineError::Unauthorized("only requesters book"));
        }
        let slot = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        check_within(&slot, &range)?;

        let engine = Arc::clone(self);
        detached(async move {
            let gate = engine.enter_commit(slot.id).await?;
            let mut ledger = engine.acquire_slot(slot.id).await?;
            if !engine.slots.contains(&slot.id) {
                return Err(EngineError::SlotNotFound(slot.id));
            }
            check_free(&ledger, &range, None)?;

            let booking = Booking {
                id: Ulid::new(),
                slot_id: slot.id,
                requester_id: actor.id,
                range,
                status: BookingStatus::Confirmed,
                created_at: engine.clock.now(),
            };
            let id = booking.id;
            let event = Event::BookingConfirmed {
                booking,
                provider_id: slot.provider_id,
            };
            engine
                .persist_and_apply(&gate, &mut [&mut *ledger], &event)
                .await?;
            info!(booking_id = %id, %slot_id, requester_id = %actor.id, %range, "booking confirmed");
            Ok(id)
        })
        .await
    }

    /// Book with client defaults: a missing start is the slot start,
    /// a missing end is start plus `duration_minutes` (or the configured
    /// default length).
    pub async fn book_times(
        self: &Arc<Self>,
        actor: Actor,
        slot_id: SlotId,
        start: Option<NaiveTime>,
        end: Option<NaiveTime>,
        duration_minutes: Option<i64>,
    ) -> Result<BookingId, EngineError> {
        let slot = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        let range = resolve_times(
            &slot.range,
            start,
            end,
            duration_minutes.unwrap_or(self.config.default_booking_minutes),
        )?;
        self.book(actor, slot_id, range).await
    }

    /// Cancel a booking. The requester or the slot's provider may cancel,
    /// until the change cutoff before the booking starts.
    pub async fn cancel(self: &Arc<Self>, actor: Actor, booking_id: BookingId) -> Result<(), EngineError> {
        let result = self.cancel_inner(actor, booking_id).await;
        record_outcome("cancel", &result);
        result
    }

    async fn cancel_inner(self: &Arc<Self>, actor: Actor, booking_id: BookingId) -> Result<(), EngineError> {
        let booking = self
            .ledger
            .get(&booking_id)
            .await
            .ok_or(EngineError::NotFound(booking_id))?;
        if actor.role == Role::Requester && booking.requester_id != actor.id {
            return Err(EngineError::Unauthorized("not a party to this booking"));
        }
        // A removed slot keeps only cancelled bookings.
        if !booking.is_active() {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }
        let slot_id = booking.slot_id;
        let slot = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if actor.role == Role::Provider && slot.provider_id != actor.id {
            return Err(EngineError::Unauthorized("not a party to this booking"));
        }

        let engine = Arc::clone(self);
        detached(async move {
            let gate = engine.enter_commit(slot_id).await?;
            let mut ledger = engine.acquire_slot(slot_id).await?;
            let current = ledger
                .get(&booking_id)
                .cloned()
                .ok_or(EngineError::NotFound(booking_id))?;
            if !current.is_active() {
                return Err(EngineError::AlreadyCancelled(booking_id));
            }
            check_change_window(&current, engine.clock.now(), engine.config.change_cutoff)?;

            let event = Event::BookingCancelled {
                id: booking_id,
                slot_id,
                requester_id: current.requester_id,
                provider_id: slot.provider_id,
                cancelled_by: actor.id,
                at: engine.clock.now(),
            };
            engine
                .persist_and_apply(&gate, &mut [&mut *ledger], &event)
                .await?;
            info!(%booking_id, %slot_id, cancelled_by = %actor.id, "booking cancelled");
            Ok(())
        })
        .await
    }

    /// Move a booking to `range` on `new_slot_id` (possibly the same slot).
    /// The old booking is cancelled and the new one confirmed in a single
    /// logged record while both slots are held.
    pub async fn reschedule(
        self: &Arc<Self>,
        actor: Actor,
        booking_id: BookingId,
        new_slot_id: SlotId,
        range: TimeRange,
    ) -> Result<BookingId, EngineError> {
        let result = self.reschedule_inner(actor, booking_id, new_slot_id, range).await;
        record_outcome("reschedule", &result);
        result
    }

    async fn reschedule_inner(
        self: &Arc<Self>,
        actor: Actor,
        booking_id: BookingId,
        new_slot_id: SlotId,
        range: TimeRange,
    ) -> Result<BookingId, EngineError> {
        if actor.role != Role::Requester {
            return Err(EngineError::Unauthorized("only the requester may reschedule"));
        }
        let old_slot_id = self
            .ledger
            .slot_for(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let old_slot = self
            .slots
            .get(&old_slot_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let new_slot = self
            .slots
            .get(&new_slot_id)
            .ok_or(EngineError::SlotNotFound(new_slot_id))?;
        check_within(&new_slot, &range)?;

        let engine = Arc::clone(self);
        detached(async move {
            let gate = engine.enter_commit(new_slot_id).await?;

            // Acquire in sorted id order so two reschedules crossing the same
            // pair of slots cannot deadlock.
            let mut lane_ids = vec![old_slot_id, new_slot_id];
            lane_ids.sort();
            lane_ids.dedup();
            let mut guards = Vec::with_capacity(lane_ids.len());
            for id in &lane_ids {
                guards.push(engine.acquire_slot(*id).await?);
            }
            if !engine.slots.contains(&new_slot_id) {
                return Err(EngineError::SlotNotFound(new_slot_id));
            }

            let old = guards
                .iter()
                .find(|g| g.slot_id == old_slot_id)
                .and_then(|g| g.get(&booking_id).cloned())
                .ok_or(EngineError::NotFound(booking_id))?;
            if old.requester_id != actor.id {
                return Err(EngineError::Unauthorized("only the requester may reschedule"));
            }
            if !old.is_active() {
                return Err(EngineError::AlreadyCancelled(booking_id));
            }
            let now = engine.clock.now();
            check_change_window(&old, now, engine.config.change_cutoff)?;

            let ignoring = (old_slot_id == new_slot_id).then_some(booking_id);
            let target = guards
                .iter()
                .find(|g| g.slot_id == new_slot_id)
                .ok_or(EngineError::SlotNotFound(new_slot_id))?;
            check_free(target, &range, ignoring)?;

            let booking = Booking {
                id: Ulid::new(),
                slot_id: new_slot_id,
                requester_id: actor.id,
                range,
                status: BookingStatus::Confirmed,
                created_at: now,
            };
            let new_id = booking.id;
            let event = Event::BookingRescheduled {
                from: booking_id,
                from_slot: old_slot_id,
                from_provider_id: old_slot.provider_id,
                booking,
                provider_id: new_slot.provider_id,
                at: now,
            };
            let mut ledgers: Vec<&mut SlotLedger> = guards.iter_mut().map(|g| &mut **g).collect();
            engine.persist_and_apply(&gate, &mut ledgers, &event).await?;
            info!(from = %booking_id, to = %new_id, slot_id = %new_slot_id, %range, "booking rescheduled");
            Ok(new_id)
        })
        .await
    }
}

/// Fill in omitted booking times from the slot.
pub(crate) fn resolve_times(
    slot: &TimeRange,
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
    duration_minutes: i64,
) -> Result<TimeRange, EngineError> {
    let start = start.unwrap_or(slot.start());
    let end = match end {
        Some(end) => end,
        None => {
            let (end, wrapped) = start.overflowing_add_signed(TimeDelta::minutes(duration_minutes));
            if wrapped != 0 {
                return Err(EngineError::InvalidRange(InvalidRange { start, end }));
            }
            end
        }
    };
    Ok(TimeRange::new(slot.date(), start, end)?)
}

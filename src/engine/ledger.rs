use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::*;

use super::availability::free_ranges;
use super::EngineError;

/// One slot's bookings behind the slot's exclusivity lock.
pub type SharedSlotLedger = Arc<RwLock<SlotLedger>>;

/// Bookings recorded against a single slot, sorted by start time. Cancelled
/// bookings stay in the list with their final status.
#[derive(Debug, Clone)]
pub struct SlotLedger {
    pub slot_id: SlotId,
    pub slot_range: TimeRange,
    bookings: Vec<Booking>,
}

impl SlotLedger {
    pub fn new(slot_id: SlotId, slot_range: TimeRange) -> Self {
        Self {
            slot_id,
            slot_range,
            bookings: Vec::new(),
        }
    }

    pub fn all(&self) -> &[Booking] {
        &self.bookings
    }

    pub fn active(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.is_active())
    }

    pub fn has_active(&self) -> bool {
        self.active().next().is_some()
    }

    /// Pending and Confirmed bookings, ordered by start time.
    pub fn list(&self) -> Vec<Booking> {
        self.active().cloned().collect()
    }

    pub fn get(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// First active booking overlapping `range`, skipping `ignoring`.
    pub fn first_conflict(&self, range: &TimeRange, ignoring: Option<BookingId>) -> Option<BookingId> {
        self.active()
            .filter(|b| Some(b.id) != ignoring)
            .find(|b| b.range.overlaps(range))
            .map(|b| b.id)
    }

    /// Contained in the slot and clear of every active booking.
    pub fn is_free(&self, range: &TimeRange) -> bool {
        self.slot_range.contains(range) && self.first_conflict(range, None).is_none()
    }

    pub fn free_ranges(&self) -> Vec<TimeRange> {
        free_ranges(&self.slot_range, &self.bookings)
    }

    pub fn is_consumed(&self) -> bool {
        self.free_ranges().is_empty()
    }

    /// Insert a booking the caller has already cleared under exclusivity.
    /// Re-asserts containment and non-overlap; a failure here means the
    /// coordinator's locking was bypassed.
    pub fn append(&mut self, booking: Booking) -> Result<BookingId, EngineError> {
        if booking.slot_id != self.slot_id {
            return Err(EngineError::InvariantViolation(format!(
                "booking {} targets slot {} but was appended to {}",
                booking.id, booking.slot_id, self.slot_id
            )));
        }
        if !self.slot_range.contains(&booking.range) {
            return Err(EngineError::InvariantViolation(format!(
                "booking {} range {} escapes slot {} ({})",
                booking.id, booking.range, self.slot_id, self.slot_range
            )));
        }
        if booking.is_active()
            && let Some(other) = self.first_conflict(&booking.range, None) {
                return Err(EngineError::InvariantViolation(format!(
                    "booking {} overlaps booking {other} on slot {}",
                    booking.id, self.slot_id
                )));
            }
        let id = booking.id;
        self.record(booking);
        Ok(id)
    }

    /// Insert maintaining sort order by start, without checks (WAL replay).
    pub(super) fn record(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start() <= booking.range.start());
        self.bookings.insert(pos, booking);
    }

    pub fn mark_cancelled(&mut self, id: &BookingId) -> Result<Booking, EngineError> {
        let booking = self
            .bookings
            .iter_mut()
            .find(|b| b.id == *id)
            .ok_or(EngineError::NotFound(*id))?;
        if !booking.is_active() {
            return Err(EngineError::AlreadyCancelled(*id));
        }
        booking.status = BookingStatus::Cancelled;
        Ok(booking.clone())
    }

    /// Re-run containment and pairwise non-overlap over the active bookings.
    pub fn verify(&self) -> Result<(), EngineError> {
        let active: Vec<&Booking> = self.active().collect();
        for (i, b) in active.iter().enumerate() {
            if !self.slot_range.contains(&b.range) {
                return Err(EngineError::InvariantViolation(format!(
                    "booking {} escapes slot {}",
                    b.id, self.slot_id
                )));
            }
            if let Some(other) = active[i + 1..].iter().find(|o| o.range.overlaps(&b.range)) {
                return Err(EngineError::InvariantViolation(format!(
                    "bookings {} and {} overlap on slot {}",
                    b.id, other.id, self.slot_id
                )));
            }
        }
        Ok(())
    }
}

/// Booking Ledger: write authority over all bookings, partitioned per slot so
/// that mutations on different slots never share a lock.
pub struct BookingLedger {
    lanes: DashMap<SlotId, SharedSlotLedger>,
    booking_to_slot: DashMap<BookingId, SlotId>,
    by_requester: DashMap<ActorId, Vec<BookingId>>,
    /// Bookings of removed slots. All of them are cancelled.
    retired: DashMap<BookingId, Booking>,
}

impl Default for BookingLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingLedger {
    pub fn new() -> Self {
        Self {
            lanes: DashMap::new(),
            booking_to_slot: DashMap::new(),
            by_requester: DashMap::new(),
            retired: DashMap::new(),
        }
    }

    pub fn open_lane(&self, slot_id: SlotId, slot_range: TimeRange) -> SharedSlotLedger {
        self.lanes
            .entry(slot_id)
            .or_insert_with(|| Arc::new(RwLock::new(SlotLedger::new(slot_id, slot_range))))
            .value()
            .clone()
    }

    pub fn lane(&self, slot_id: &SlotId) -> Option<SharedSlotLedger> {
        self.lanes.get(slot_id).map(|e| e.value().clone())
    }

    pub fn close_lane(&self, slot_id: &SlotId) -> Option<SharedSlotLedger> {
        self.lanes.remove(slot_id).map(|(_, lane)| lane)
    }

    /// Keep the history of a slot that is being removed.
    pub(super) fn retire(&self, bookings: &[Booking]) {
        for b in bookings {
            self.retired.insert(b.id, b.clone());
        }
    }

    pub fn lane_ids(&self) -> Vec<SlotId> {
        self.lanes.iter().map(|e| *e.key()).collect()
    }

    pub fn slot_for(&self, booking_id: &BookingId) -> Option<SlotId> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    pub(super) fn index(&self, booking: &Booking) {
        if self
            .booking_to_slot
            .insert(booking.id, booking.slot_id)
            .is_none()
        {
            self.by_requester
                .entry(booking.requester_id)
                .or_default()
                .push(booking.id);
        }
    }

    pub fn booking_ids_of(&self, requester_id: &ActorId) -> Vec<BookingId> {
        self.by_requester
            .get(requester_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub async fn get(&self, booking_id: &BookingId) -> Option<Booking> {
        if let Some(b) = self.retired.get(booking_id) {
            return Some(b.value().clone());
        }
        let lane = self.lane(&self.slot_for(booking_id)?)?;
        let guard = lane.read().await;
        guard.get(booking_id).cloned()
    }

    /// Active bookings on a slot, ordered by start time.
    pub async fn list_by_slot(&self, slot_id: &SlotId) -> Vec<Booking> {
        match self.lane(slot_id) {
            Some(lane) => lane.read().await.list(),
            None => Vec::new(),
        }
    }

    pub async fn is_free(&self, slot_id: &SlotId, range: &TimeRange) -> bool {
        match self.lane(slot_id) {
            Some(lane) => lane.read().await.is_free(range),
            None => false,
        }
    }

    pub async fn verify(&self) -> Result<(), EngineError> {
        for slot_id in self.lane_ids() {
            if let Some(lane) = self.lane(&slot_id) {
                lane.read().await.verify()?;
            }
        }
        Ok(())
    }
}

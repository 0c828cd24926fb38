use crate::model::*;

use super::conflict::validate_query_window;
use super::store::sort_slots;
use super::{Engine, EngineError};

fn sort_bookings(bookings: &mut [Booking]) {
    bookings.sort_by_key(|b| (b.range.date(), b.range.start(), b.id));
}

impl Engine {
    pub fn get_slot(&self, slot_id: &SlotId) -> Result<AvailabilitySlot, EngineError> {
        self.slots
            .get(slot_id)
            .ok_or(EngineError::SlotNotFound(*slot_id))
    }

    pub fn list_by_provider(
        &self,
        provider_id: &ActorId,
        window: Option<&DateWindow>,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        if let Some(w) = window {
            validate_query_window(w)?;
        }
        Ok(self.slots.list_by_provider(provider_id, window))
    }

    /// Slots a requester can still book: not dated before today and with at
    /// least one free sub-range.
    pub async fn list_bookable(
        &self,
        provider_id: Option<&ActorId>,
        window: Option<&DateWindow>,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        if let Some(w) = window {
            validate_query_window(w)?;
        }
        let today = self.clock.today();
        let candidates = match provider_id {
            Some(p) => self.slots.list_by_provider(p, window),
            None => self
                .slots
                .all()
                .into_iter()
                .filter(|s| window.is_none_or(|w| w.contains(s.range.date())))
                .collect(),
        };

        let mut out = Vec::new();
        for slot in candidates {
            if slot.range.date() < today {
                continue;
            }
            let Some(lane) = self.ledger.lane(&slot.id) else {
                continue;
            };
            if lane.read().await.is_consumed() {
                continue;
            }
            out.push(slot);
        }
        sort_slots(&mut out);
        Ok(out)
    }

    /// Active bookings on a slot, ordered by start time.
    pub async fn list_by_slot(&self, slot_id: &SlotId) -> Result<Vec<Booking>, EngineError> {
        if !self.slots.contains(slot_id) {
            return Err(EngineError::SlotNotFound(*slot_id));
        }
        Ok(self.ledger.list_by_slot(slot_id).await)
    }

    pub async fn is_free(&self, slot_id: &SlotId, range: &TimeRange) -> bool {
        self.ledger.is_free(slot_id, range).await
    }

    /// Sub-ranges of the slot not covered by active bookings.
    pub async fn free_ranges(&self, slot_id: &SlotId) -> Result<Vec<TimeRange>, EngineError> {
        let lane = self
            .ledger
            .lane(slot_id)
            .ok_or(EngineError::SlotNotFound(*slot_id))?;
        let ledger = lane.read().await;
        Ok(ledger.free_ranges())
    }

    pub async fn get_booking(&self, booking_id: &BookingId) -> Result<Booking, EngineError> {
        self.ledger
            .get(booking_id)
            .await
            .ok_or(EngineError::NotFound(*booking_id))
    }

    /// Every booking a requester has made, cancelled ones included.
    pub async fn list_by_requester(&self, requester_id: &ActorId) -> Vec<Booking> {
        let mut out = Vec::new();
        for id in self.ledger.booking_ids_of(requester_id) {
            if let Some(b) = self.ledger.get(&id).await {
                out.push(b);
            }
        }
        sort_bookings(&mut out);
        out
    }

    /// Bookings visible to an actor: a requester's own bookings, or every
    /// booking on a provider's slots.
    pub async fn bookings_for(&self, actor: &Actor) -> Vec<Booking> {
        match actor.role {
            Role::Requester => self.list_by_requester(&actor.id).await,
            Role::Provider => {
                let mut out = Vec::new();
                for slot in self.slots.list_by_provider(&actor.id, None) {
                    if let Some(lane) = self.ledger.lane(&slot.id) {
                        out.extend(lane.read().await.all().iter().cloned());
                    }
                }
                sort_bookings(&mut out);
                out
            }
        }
    }

    /// Providers with at least one bookable slot, in id order.
    pub async fn providers_with_availability(&self) -> Vec<ActorId> {
        let mut out = Vec::new();
        for provider_id in self.slots.providers() {
            match self.list_bookable(Some(&provider_id), None).await {
                Ok(slots) if !slots.is_empty() => out.push(provider_id),
                _ => {}
            }
        }
        out
    }

    /// Re-check containment and non-overlap across every slot ledger.
    pub async fn verify_ledger(&self) -> Result<(), EngineError> {
        self.ledger.verify().await
    }
}

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::model::*;

/// Availability Slot Store. Slots are immutable once inserted; the only
/// mutation is removal. Consumption is derived from the ledger, never stored.
pub struct SlotStore {
    slots: DashMap<SlotId, AvailabilitySlot>,
    by_provider: DashMap<ActorId, Vec<SlotId>>,
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            by_provider: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &SlotId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &SlotId) -> Option<AvailabilitySlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn insert(&self, slot: AvailabilitySlot) -> SlotId {
        let id = slot.id;
        let provider_id = slot.provider_id;
        if self.slots.insert(id, slot).is_none() {
            self.by_provider.entry(provider_id).or_default().push(id);
        }
        id
    }

    pub fn remove(&self, id: &SlotId) -> Option<AvailabilitySlot> {
        let (_, slot) = self.slots.remove(id)?;
        if let Some(mut ids) = self.by_provider.get_mut(&slot.provider_id) {
            ids.retain(|s| s != id);
        }
        Some(slot)
    }

    pub fn provider_slot_count(&self, provider_id: &ActorId) -> usize {
        self.by_provider
            .get(provider_id)
            .map_or(0, |ids| ids.len())
    }

    /// Slots of one provider ordered by date, then start time.
    pub fn list_by_provider(
        &self,
        provider_id: &ActorId,
        window: Option<&DateWindow>,
    ) -> Vec<AvailabilitySlot> {
        let ids = self
            .by_provider
            .get(provider_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut slots: Vec<AvailabilitySlot> = ids
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|s| window.is_none_or(|w| w.contains(s.range.date())))
            .collect();
        sort_slots(&mut slots);
        slots
    }

    pub fn on_date(&self, provider_id: &ActorId, date: NaiveDate) -> Vec<AvailabilitySlot> {
        self.list_by_provider(provider_id, Some(&DateWindow::single(date)))
    }

    pub fn providers(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self
            .by_provider
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<AvailabilitySlot> {
        let mut slots: Vec<AvailabilitySlot> =
            self.slots.iter().map(|e| e.value().clone()).collect();
        sort_slots(&mut slots);
        slots
    }
}

pub(crate) fn sort_slots(slots: &mut [AvailabilitySlot]) {
    slots.sort_by_key(|s| (s.range.date(), s.range.start(), s.id));
}

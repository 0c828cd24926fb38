use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Publish one dated slot. Fails with `SlotOverlap` if it overlaps another
    /// slot of the same provider.
    pub async fn create_slot(
        &self,
        actor: Actor,
        range: TimeRange,
        hourly_rate: Money,
    ) -> Result<SlotId, EngineError> {
        if actor.role != Role::Provider {
            return Err(EngineError::Unauthorized("only providers publish availability"));
        }

        let gate = self.enter_commit(actor.id).await?;
        let _provider = self.lock_provider(actor.id).await?;

        if let Some(existing) = self
            .slots
            .on_date(&actor.id, range.date())
            .into_iter()
            .find(|s| s.range.overlaps(&range))
        {
            return Err(EngineError::SlotOverlap(existing.id));
        }
        if self.slots.provider_slot_count(&actor.id) >= MAX_SLOTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many slots for provider"));
        }

        let slot = AvailabilitySlot {
            id: Ulid::new(),
            provider_id: actor.id,
            range,
            hourly_rate,
            created_at: self.clock.now(),
        };
        let id = slot.id;
        self.persist_and_apply(&gate, &mut [], &Event::SlotCreated { slot })
            .await?;
        metrics::counter!(crate::observability::SLOTS_CREATED_TOTAL, "source" => "direct")
            .increment(1);
        info!(provider_id = %actor.id, slot_id = %id, %range, "slot created");
        Ok(id)
    }

    /// Withdraw a slot. Only its provider may, and only while nothing active
    /// is booked on it.
    pub async fn remove_slot(&self, actor: Actor, slot_id: SlotId) -> Result<(), EngineError> {
        let slot = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        if actor.role != Role::Provider || slot.provider_id != actor.id {
            return Err(EngineError::Unauthorized("only the slot's provider may remove it"));
        }

        let gate = self.enter_commit(actor.id).await?;
        let _provider = self.lock_provider(actor.id).await?;
        let mut ledger = self.acquire_slot(slot_id).await?;
        if !self.slots.contains(&slot_id) {
            return Err(EngineError::SlotNotFound(slot_id));
        }
        if ledger.has_active() {
            return Err(EngineError::SlotHasBookings(slot_id));
        }

        let event = Event::SlotRemoved {
            id: slot_id,
            provider_id: actor.id,
        };
        self.persist_and_apply(&gate, &mut [&mut *ledger], &event).await?;
        info!(provider_id = %actor.id, %slot_id, "slot removed");
        Ok(())
    }

    /// Record where notices for an actor are delivered.
    pub fn register_contact(&self, actor_id: ActorId, contact: &str) -> Result<(), EngineError> {
        if contact.len() > MAX_CONTACT_LEN {
            return Err(EngineError::LimitExceeded("contact too long"));
        }
        self.set_contact(actor_id, contact.to_string());
        Ok(())
    }

    /// Rewrite the WAL with the events needed to recreate the current state.
    /// Takes the commit gate exclusively: every in-flight commit finishes
    /// first and none starts until the snapshot is on disk.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = Vec::new();
        let mut providers: Vec<ActorId> = self.schedules.iter().map(|e| *e.key()).collect();
        providers.sort();
        for provider_id in providers {
            events.push(Event::ScheduleReplaced {
                provider_id,
                rules: self.schedule(&provider_id),
            });
        }

        let slots = self.slots.all();
        for slot in &slots {
            events.push(Event::SlotCreated { slot: slot.clone() });
        }
        for slot in &slots {
            let Some(lane) = self.ledger.lane(&slot.id) else {
                continue;
            };
            let ledger = lane.read().await;
            // Cancelled bookings carry their status through the snapshot.
            for booking in ledger.all() {
                events.push(Event::BookingConfirmed {
                    booking: booking.clone(),
                    provider_id: slot.provider_id,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, "WAL compacted");
        Ok(())
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

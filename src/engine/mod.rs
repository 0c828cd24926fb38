mod availability;
mod conflict;
mod coordinator;
mod error;
mod ledger;
mod mutations;
mod queries;
mod recurrence;
mod store;

pub use availability::{free_ranges, merge_overlapping, subtract_intervals};
pub use error::{EngineError, ErrorClass};
pub use ledger::{BookingLedger, SharedSlotLedger, SlotLedger};
pub use recurrence::{expand, validate_rules};
pub use store::SlotStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use tracing::{error, warn};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// Held for the whole of a commit. Compaction takes the write side, so a
/// snapshot never races an append that has not yet been applied in memory.
pub(crate) type CommitGate = OwnedRwLockReadGuard<()>;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded wait for a slot's exclusivity before failing with `Timeout`.
    pub lock_timeout: Duration,
    /// Bookings starting sooner than this can no longer be cancelled or moved.
    pub change_cutoff: Duration,
    /// Default expansion window for a published weekly schedule.
    pub expansion_days: i64,
    /// Booking length when the caller gives a start but no end.
    pub default_booking_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            change_cutoff: Duration::from_secs(12 * 3600),
            expansion_days: 28,
            default_booking_minutes: 30,
        }
    }
}

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    error!("WAL flush failed for {} events: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the
    // next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
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
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

pub struct Engine {
    pub slots: SlotStore,
    pub ledger: BookingLedger,
    pub(super) schedules: DashMap<ActorId, Vec<WeeklyScheduleRule>>,
    /// Serializes slot creation and schedule expansion per provider.
    provider_lanes: DashMap<ActorId, Arc<Mutex<()>>>,
    contacts: DashMap<ActorId, String>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub notify: Arc<NotifyHub>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: Arc<RwLock<()>>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: SlotStore::new(),
            ledger: BookingLedger::new(),
            schedules: DashMap::new(),
            provider_lanes: DashMap::new(),
            contacts: DashMap::new(),
            clock,
            config,
            notify,
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
        };

        for event in &events {
            engine.replay_event(event)?;
        }

        Ok(engine)
    }

    /// Apply one logged event during startup. We're the sole owner of every
    /// lane here, so try_write always succeeds; never block_on because this
    /// may run inside an async context (lazy tenant creation).
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let mut guards = Vec::new();
        for slot_id in event_slot_ids(event) {
            if let Some(lane) = self.ledger.lane(&slot_id) {
                let guard = lane
                    .try_write_owned()
                    .map_err(|_| io::Error::other("replay: slot ledger contended"))?;
                guards.push(guard);
            }
        }
        let mut ledgers: Vec<&mut SlotLedger> = guards.iter_mut().map(|g| &mut **g).collect();
        if let Err(e) = self.apply_event(event, &mut ledgers) {
            warn!("replay: skipped event: {e}");
        }
        Ok(())
    }

    /// Apply an event to memory. Booking events need the write guards of the
    /// slots they touch; the caller holds them.
    pub(super) fn apply_event(
        &self,
        event: &Event,
        ledgers: &mut [&mut SlotLedger],
    ) -> Result<(), EngineError> {
        match event {
            Event::SlotCreated { slot } => {
                self.ledger.open_lane(slot.id, slot.range);
                self.slots.insert(slot.clone());
            }
            Event::SlotRemoved { id, .. } => {
                if let Ok(ledger) = find_ledger(ledgers, *id) {
                    self.ledger.retire(ledger.all());
                }
                self.slots.remove(id);
                self.ledger.close_lane(id);
            }
            Event::ScheduleReplaced { provider_id, rules } => {
                self.schedules.insert(*provider_id, rules.clone());
            }
            Event::BookingConfirmed { booking, .. } => {
                find_ledger(ledgers, booking.slot_id)?.append(booking.clone())?;
                self.ledger.index(booking);
            }
            Event::BookingCancelled { id, slot_id, .. } => {
                find_ledger(ledgers, *slot_id)?.mark_cancelled(id)?;
            }
            Event::BookingRescheduled {
                from,
                from_slot,
                booking,
                ..
            } => {
                find_ledger(ledgers, *from_slot)?.mark_cancelled(from)?;
                find_ledger(ledgers, booking.slot_id)?.append(booking.clone())?;
                self.ledger.index(booking);
            }
        }
        Ok(())
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

    /// Enter the shared side of the commit gate, bounded by `lock_timeout`.
    /// `waiting_on` names the slot or provider the caller is after.
    pub(super) async fn enter_commit(&self, waiting_on: Ulid) -> Result<CommitGate, EngineError> {
        tokio::time::timeout(self.config.lock_timeout, self.commit_gate.clone().read_owned())
            .await
            .map_err(|_| {
                warn!(%waiting_on, "commit gate wait timed out");
                EngineError::Timeout(waiting_on)
            })
    }

    /// WAL-append, apply, notify. Nothing reaches memory or subscribers
    /// unless the record is durable.
    pub(super) async fn persist_and_apply(
        &self,
        _gate: &CommitGate,
        ledgers: &mut [&mut SlotLedger],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        if let Err(e) = self.apply_event(event, ledgers) {
            error!("logged event could not be applied: {e}");
            return Err(e);
        }
        self.notify.send(event);
        Ok(())
    }

    fn provider_lane(&self, provider_id: ActorId) -> Arc<Mutex<()>> {
        self.provider_lanes
            .entry(provider_id)
            .or_default()
            .value()
            .clone()
    }

    /// Serialize slot changes of one provider, bounded by `lock_timeout`.
    pub(super) async fn lock_provider(
        &self,
        provider_id: ActorId,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lane = self.provider_lane(provider_id);
        tokio::time::timeout(self.config.lock_timeout, lane.lock_owned())
            .await
            .map_err(|_| {
                warn!(%provider_id, "provider lane wait timed out");
                EngineError::Timeout(provider_id)
            })
    }

    /// Wait for a slot's exclusivity, bounded by `lock_timeout`.
    pub(super) async fn acquire_slot(
        &self,
        slot_id: SlotId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<SlotLedger>, EngineError> {
        let lane = self
            .ledger
            .lane(&slot_id)
            .ok_or(EngineError::SlotNotFound(slot_id))?;
        let started = std::time::Instant::now();
        let guard = tokio::time::timeout(self.config.lock_timeout, lane.write_owned())
            .await
            .map_err(|_| {
                warn!(%slot_id, "slot exclusivity wait timed out");
                EngineError::Timeout(slot_id)
            })?;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(guard)
    }

    pub fn contact(&self, actor_id: &ActorId) -> Option<String> {
        self.contacts.get(actor_id).map(|e| e.value().clone())
    }

    pub(super) fn set_contact(&self, actor_id: ActorId, contact: String) {
        self.contacts.insert(actor_id, contact);
    }
}

fn find_ledger<'a>(
    ledgers: &'a mut [&mut SlotLedger],
    slot_id: SlotId,
) -> Result<&'a mut SlotLedger, EngineError> {
    ledgers
        .iter_mut()
        .find(|l| l.slot_id == slot_id)
        .map(|l| &mut **l)
        .ok_or_else(|| EngineError::InvariantViolation(format!("slot {slot_id} not held")))
}

/// Slots whose ledgers an event mutates, sorted and deduplicated.
fn event_slot_ids(event: &Event) -> Vec<SlotId> {
    let mut ids = match event {
        Event::BookingConfirmed { booking, .. } => vec![booking.slot_id],
        Event::BookingCancelled { slot_id, .. } => vec![*slot_id],
        Event::SlotRemoved { id, .. } => vec![*id],
        Event::BookingRescheduled {
            from_slot, booking, ..
        } => vec![*from_slot, booking.slot_id],
        Event::SlotCreated { .. } | Event::ScheduleReplaced { .. } => Vec::new(),
    };
    ids.sort();
    ids.dedup();
    ids
}

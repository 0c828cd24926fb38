use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::{ActorId, BookingId, Event};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for engine events: one channel per provider plus a firehose
/// carrying every event of the tenant.
pub struct NotifyHub {
    channels: DashMap<ActorId, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY * 4).0,
        }
    }

    /// Subscribe to events touching one provider's availability.
    pub fn subscribe(&self, provider_id: ActorId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Publish an event. No-op for channels nobody listens on.
    pub fn send(&self, event: &Event) {
        let _ = self.all.send(event.clone());
        let provider_id = event.provider_id();
        self.send_to(provider_id, event);
        if let Event::BookingRescheduled {
            from_provider_id, ..
        } = event
            && *from_provider_id != provider_id
        {
            self.send_to(*from_provider_id, event);
        }
    }

    fn send_to(&self, provider_id: ActorId, event: &Event) {
        if let Some(sender) = self.channels.get(&provider_id) {
            let _ = sender.send(event.clone());
        }
    }
}

// ── Outbound notifications ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailed(pub String);

impl std::fmt::Display for DeliveryFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryFailed {}

/// Sends a booking notice to one recipient. Delivery is best-effort: the
/// booking outcome never depends on it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, booking_id: BookingId, recipient_contact: &str) -> Result<(), DeliveryFailed>;
}

/// Writes each notice as a structured log line.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, booking_id: BookingId, recipient_contact: &str) -> Result<(), DeliveryFailed> {
        let payload = serde_json::json!({
            "booking_id": booking_id.to_string(),
            "to": recipient_contact,
        });
        info!(notice = %payload, "booking notice");
        Ok(())
    }
}

/// Booking id and parties to notify for one event. Non-booking events yield nothing.
pub fn recipients(event: &Event) -> Option<(BookingId, Vec<ActorId>)> {
    let (booking_id, mut parties) = match event {
        Event::BookingConfirmed {
            booking,
            provider_id,
        } => (booking.id, vec![booking.requester_id, *provider_id]),
        Event::BookingCancelled {
            id,
            requester_id,
            provider_id,
            ..
        } => (*id, vec![*requester_id, *provider_id]),
        Event::BookingRescheduled {
            booking,
            provider_id,
            from_provider_id,
            ..
        } => (
            booking.id,
            vec![booking.requester_id, *provider_id, *from_provider_id],
        ),
        Event::SlotCreated { .. } | Event::SlotRemoved { .. } | Event::ScheduleReplaced { .. } => {
            return None;
        }
    };
    parties.dedup();
    if parties.len() == 3 && parties[0] == parties[2] {
        parties.pop();
    }
    Some((booking_id, parties))
}

/// Start the background task that notifies both parties of every booking
/// change. Subscribes before returning so no event after the call is missed.
/// Failures are logged and counted, never propagated.
pub fn spawn_dispatcher(engine: Arc<Engine>, notifier: Arc<dyn Notifier>) -> JoinHandle<()> {
    let rx = engine.notify.subscribe_all();
    tokio::spawn(run_dispatcher(engine, notifier, rx))
}

async fn run_dispatcher(
    engine: Arc<Engine>,
    notifier: Arc<dyn Notifier>,
    mut rx: broadcast::Receiver<Event>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification dispatcher lagged, notices dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some((booking_id, parties)) = recipients(&event) else {
            continue;
        };
        for actor_id in parties {
            let Some(contact) = engine.contact(&actor_id) else {
                debug!(%booking_id, %actor_id, "no contact registered, notice skipped");
                continue;
            };
            match notifier.notify(booking_id, &contact).await {
                Ok(()) => {
                    metrics::counter!(crate::observability::NOTICES_TOTAL, "status" => "sent")
                        .increment(1);
                }
                Err(e) => {
                    metrics::counter!(crate::observability::NOTICES_TOTAL, "status" => "failed")
                        .increment(1);
                    warn!(%booking_id, %actor_id, "{e}");
                }
            }
        }
    }
}

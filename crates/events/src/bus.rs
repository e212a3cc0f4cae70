//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans out every [`ServerEvent`] (alarm, power and liveness
//! transitions from the core, plus daily reports) to the dispatcher and any
//! other subscriber. Share it as `Arc<EventBus>`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use tankalarm_core::hashing::sha256_hex;
use tankalarm_core::liveness::LivenessKind;
use tankalarm_core::schema::ViewerSummary;
use tankalarm_core::server::CoreEvent;
use tankalarm_core::types::Epoch;

// ---------------------------------------------------------------------------
// ServerEvent
// ---------------------------------------------------------------------------

pub const EVENT_ALARM: &str = "tank.alarm";
pub const EVENT_POWER: &str = "tank.power";
pub const EVENT_PEER_DOWN: &str = "peer.down";
pub const EVENT_PEER_RESTORED: &str = "peer.restored";
pub const EVENT_DAILY_REPORT: &str = "report.daily";

/// The once-a-day site summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    /// The scheduled time this report was produced for.
    pub due_epoch: Epoch,
    pub summary: ViewerSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventBody {
    Core(CoreEvent),
    DailyReport(DailyReport),
}

/// A notification-worthy occurrence published on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
    /// Dot-separated event name, e.g. `"tank.alarm"`.
    pub event_type: &'static str,
    pub body: EventBody,
    pub timestamp: DateTime<Utc>,
}

impl ServerEvent {
    pub fn core(event: CoreEvent) -> Self {
        let event_type = match &event {
            CoreEvent::Alarm(_) => EVENT_ALARM,
            CoreEvent::Power(_) => EVENT_POWER,
            CoreEvent::Liveness(e) => match e.kind {
                LivenessKind::PeerDown => EVENT_PEER_DOWN,
                LivenessKind::PeerRestored => EVENT_PEER_RESTORED,
            },
        };
        Self {
            event_type,
            body: EventBody::Core(event),
            timestamp: Utc::now(),
        }
    }

    pub fn daily_report(report: DailyReport) -> Self {
        Self {
            event_type: EVENT_DAILY_REPORT,
            body: EventBody::DailyReport(report),
            timestamp: Utc::now(),
        }
    }

    /// Key identifying the underlying occurrence, identical across
    /// re-publications of the same transition.
    pub fn dedup_key(&self) -> String {
        match &self.body {
            EventBody::Core(e) => e.dedup_key(),
            EventBody::DailyReport(r) => {
                sha256_hex(format!("daily|{}", r.due_epoch).as_bytes())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest unconsumed events are dropped and
    /// slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: ServerEvent) {
        // A send error only means there are no receivers.
        let _ = self.sender.send(event);
    }

    /// Publish a batch of core events in order.
    pub fn publish_core<I>(&self, events: I)
    where
        I: IntoIterator<Item = CoreEvent>,
    {
        for event in events {
            self.publish(ServerEvent::core(event));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

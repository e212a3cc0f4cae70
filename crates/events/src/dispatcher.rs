//! Notification dispatch boundary.
//!
//! [`NotificationDispatcher`] subscribes to the [`EventBus`](crate::bus::EventBus),
//! drops re-deliveries of an occurrence it already handled, renders a short
//! text message and hands it to a [`RelayOutbox`]. The outbox owns the actual
//! SMS/email transport.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use tankalarm_core::config::ContactList;
use tankalarm_core::liveness::LivenessKind;
use tankalarm_core::server::CoreEvent;
use tankalarm_core::types::{epoch_to_datetime, Epoch};

use crate::bus::{DailyReport, EventBody, ServerEvent};

/// Number of recent de-duplication keys remembered.
pub const DEDUP_WINDOW: usize = 256;

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
}

/// One rendered message for the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub channel: Channel,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub dedup_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    #[error("Relay rejected message: {0}")]
    Rejected(String),
}

/// Hand-off point to the relay transport.
#[async_trait]
pub trait RelayOutbox: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), OutboxError>;
}

/// Outbox that only logs. Used when no transport is configured.
#[derive(Debug, Default)]
pub struct TracingOutbox;

#[async_trait]
impl RelayOutbox for TracingOutbox {
    async fn send(&self, message: &OutboundMessage) -> Result<(), OutboxError> {
        tracing::info!(
            channel = ?message.channel,
            recipients = message.recipients.len(),
            subject = %message.subject,
            "Notification queued for relay"
        );
        Ok(())
    }
}

/// Outbox that records messages in memory.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RelayOutbox for MemoryOutbox {
    async fn send(&self, message: &OutboundMessage) -> Result<(), OutboxError> {
        self.sent
            .lock()
            .map_err(|_| OutboxError::Unavailable("outbox poisoned".into()))?
            .push(message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// De-duplication
// ---------------------------------------------------------------------------

/// Fixed-size memory of recently seen keys.
#[derive(Debug)]
struct DedupRing {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl DedupRing {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `key`. Returns `false` if it was already present.
    fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
        true
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn format_epoch(epoch: Epoch) -> String {
    epoch_to_datetime(epoch)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

/// Render an event into `(subject, body)`.
pub fn render(event: &ServerEvent) -> (String, String) {
    match &event.body {
        EventBody::Core(CoreEvent::Alarm(a)) => (
            format!("Tank alarm {} #{}: {}", a.client_id, a.tank_index, a.to_state),
            format!(
                "Tank {} #{} changed {} -> {} (reading {:.1}) at {}",
                a.client_id,
                a.tank_index,
                a.from_state,
                a.to_state,
                a.value,
                format_epoch(a.epoch)
            ),
        ),
        EventBody::Core(CoreEvent::Power(p)) => (
            format!("Power {} on {}", p.to.as_str(), p.client_id),
            format!(
                "Client {} supply {} -> {} at {:.2} V ({})",
                p.client_id,
                p.from.as_str(),
                p.to.as_str(),
                p.voltage,
                format_epoch(p.epoch)
            ),
        ),
        EventBody::Core(CoreEvent::Liveness(l)) => match l.kind {
            LivenessKind::PeerDown => (
                "Server heartbeat lost".to_string(),
                format!(
                    "No heartbeat since {} after power loss; checked at {}",
                    format_epoch(l.last_heartbeat_epoch),
                    format_epoch(l.epoch)
                ),
            ),
            LivenessKind::PeerRestored => (
                "Server heartbeat restored".to_string(),
                format!(
                    "Heartbeat resumed at {} (last seen {})",
                    format_epoch(l.epoch),
                    format_epoch(l.last_heartbeat_epoch)
                ),
            ),
        },
        EventBody::DailyReport(r) => render_daily(r),
    }
}

fn render_daily(report: &DailyReport) -> (String, String) {
    let s = &report.summary;
    let mut body = format!(
        "{} {}\n{} tanks, {} in alarm\n",
        s.server_name, s.location, s.tank_count, s.alarm_count
    );
    for t in &s.tanks {
        let name = if t.label.is_empty() {
            format!("{} #{}", t.client_id, t.tank_index)
        } else {
            t.label.clone()
        };
        body.push_str(&format!(
            "{name}: {:.1} in ({:.0}%) {} | {:.2} V | {}\n",
            t.level_inches,
            t.percent,
            t.alarm_state,
            t.vin_voltage,
            format_epoch(t.last_update_epoch)
        ));
    }
    (
        format!("Daily tank report {}", format_epoch(report.due_epoch)),
        body,
    )
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent(usize),
    Duplicate,
    NoRecipients,
    Failed,
}

pub struct NotificationDispatcher {
    outbox: Arc<dyn RelayOutbox>,
    contacts: watch::Receiver<ContactList>,
    recent: DedupRing,
    attempts: u32,
    retry_delay: Duration,
}

impl NotificationDispatcher {
    pub fn new(outbox: Arc<dyn RelayOutbox>, contacts: watch::Receiver<ContactList>) -> Self {
        Self {
            outbox,
            contacts,
            recent: DedupRing::new(DEDUP_WINDOW),
            attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }

    /// Override the per-message retry policy.
    pub fn with_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Consume events until cancelled or the bus closes.
    pub async fn run(
        mut self,
        mut receiver: broadcast::Receiver<ServerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Notification dispatcher cancelled");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        self.dispatch(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Dispatcher lagged, events were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, dispatcher shutting down");
                        break;
                    }
                },
            }
        }
    }

    /// Build the messages for an event, routed by the current contact list.
    pub fn messages_for(&self, event: &ServerEvent) -> Vec<OutboundMessage> {
        let contacts = self.contacts.borrow();
        let (subject, body) = render(event);
        let dedup_key = event.dedup_key();

        let routes: Vec<(Channel, &Vec<String>)> = match event.body {
            EventBody::DailyReport(_) => vec![(Channel::Email, &contacts.daily_report)],
            EventBody::Core(_) => vec![
                (Channel::Sms, &contacts.sms),
                (Channel::Email, &contacts.email),
            ],
        };

        routes
            .into_iter()
            .filter(|(_, recipients)| !recipients.is_empty())
            .map(|(channel, recipients)| OutboundMessage {
                channel,
                recipients: recipients.clone(),
                subject: subject.clone(),
                body: body.clone(),
                dedup_key: dedup_key.clone(),
            })
            .collect()
    }

    /// Handle one event.
    pub async fn dispatch(&mut self, event: &ServerEvent) -> DispatchOutcome {
        let key = event.dedup_key();
        if !self.recent.insert(&key) {
            tracing::debug!(event_type = event.event_type, "Duplicate event suppressed");
            return DispatchOutcome::Duplicate;
        }

        let messages = self.messages_for(event);
        if messages.is_empty() {
            tracing::warn!(event_type = event.event_type, "No recipients configured for event");
            return DispatchOutcome::NoRecipients;
        }

        let mut sent = 0;
        for message in &messages {
            if self.send_with_retry(message).await {
                sent += 1;
            }
        }
        if sent == 0 {
            DispatchOutcome::Failed
        } else {
            DispatchOutcome::Sent(sent)
        }
    }

    async fn send_with_retry(&self, message: &OutboundMessage) -> bool {
        for attempt in 1..=self.attempts {
            match self.outbox.send(message).await {
                Ok(()) => return true,
                Err(OutboxError::Rejected(reason)) => {
                    tracing::error!(channel = ?message.channel, %reason, "Relay rejected notification");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Notification send failed");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }
        tracing::error!(
            channel = ?message.channel,
            subject = %message.subject,
            "Notification dropped after retries"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tankalarm_core::alarm::AlarmEvent;
    use tankalarm_core::liveness::{LivenessEvent, PowerState};
    use tankalarm_core::schema::{AlarmState, ViewerSummary};

    use super::*;
    use crate::bus::EventBus;

    fn contacts() -> ContactList {
        ContactList {
            sms: vec!["+15551234567".into()],
            email: vec![],
            daily_report: vec!["ops@example.com".into()],
        }
    }

    fn alarm(epoch: Epoch) -> ServerEvent {
        ServerEvent::core(CoreEvent::Alarm(AlarmEvent {
            client_id: "C1".into(),
            tank_index: 0,
            from_state: AlarmState::Normal,
            to_state: AlarmState::High,
            epoch,
            value: 95.0,
        }))
    }

    fn dispatcher(outbox: Arc<dyn RelayOutbox>) -> (watch::Sender<ContactList>, NotificationDispatcher) {
        let (tx, rx) = watch::channel(contacts());
        (
            tx,
            NotificationDispatcher::new(outbox, rx).with_retry(3, Duration::ZERO),
        )
    }

    #[tokio::test]
    async fn alarm_goes_to_sms_once() {
        let outbox = Arc::new(MemoryOutbox::new());
        let (_tx, mut d) = dispatcher(outbox.clone());

        assert_eq!(d.dispatch(&alarm(100)).await, DispatchOutcome::Sent(1));
        assert_eq!(d.dispatch(&alarm(100)).await, DispatchOutcome::Duplicate);

        let sent = outbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, Channel::Sms);
        assert!(sent[0].body.contains("normal -> high"));
    }

    #[tokio::test]
    async fn dedup_ring_forgets_old_keys() {
        let outbox = Arc::new(MemoryOutbox::new());
        let (_tx, mut d) = dispatcher(outbox.clone());
        for epoch in 0..=DEDUP_WINDOW as Epoch {
            d.dispatch(&alarm(epoch)).await;
        }
        // Key for epoch 0 was evicted by the 257th distinct key.
        assert_eq!(d.dispatch(&alarm(0)).await, DispatchOutcome::Sent(1));
        assert_eq!(d.dispatch(&alarm(DEDUP_WINDOW as Epoch)).await, DispatchOutcome::Duplicate);
    }

    #[tokio::test]
    async fn contact_changes_apply_to_later_events() {
        let outbox = Arc::new(MemoryOutbox::new());
        let (tx, mut d) = dispatcher(outbox.clone());
        tx.send_replace(ContactList::default());
        assert_eq!(d.dispatch(&alarm(1)).await, DispatchOutcome::NoRecipients);

        tx.send_replace(ContactList {
            email: vec!["a@example.com".into()],
            ..contacts()
        });
        assert_eq!(d.dispatch(&alarm(2)).await, DispatchOutcome::Sent(2));
    }

    #[tokio::test]
    async fn daily_report_goes_to_report_recipients() {
        let outbox = Arc::new(MemoryOutbox::new());
        let (_tx, mut d) = dispatcher(outbox.clone());
        let report = ServerEvent::daily_report(DailyReport {
            due_epoch: 1_700_028_000,
            summary: ViewerSummary {
                server_name: "Farm".into(),
                location: "North".into(),
                generated_at: 1_700_028_000,
                tank_count: 0,
                alarm_count: 0,
                tanks: vec![],
            },
        });
        assert_eq!(d.dispatch(&report).await, DispatchOutcome::Sent(1));
        let sent = outbox.sent();
        assert_eq!(sent[0].channel, Channel::Email);
        assert_eq!(sent[0].recipients, vec!["ops@example.com".to_string()]);
        assert!(sent[0].body.starts_with("Farm North"));
    }

    struct FlakyOutbox {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RelayOutbox for FlakyOutbox {
        async fn send(&self, _message: &OutboundMessage) -> Result<(), OutboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(OutboxError::Unavailable("no signal".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let outbox = Arc::new(FlakyOutbox {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let (_tx, mut d) = dispatcher(outbox.clone());
        assert_eq!(d.dispatch(&alarm(5)).await, DispatchOutcome::Sent(1));
        assert_eq!(outbox.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_loop_consumes_bus_until_cancelled() {
        let bus = EventBus::default();
        let outbox = Arc::new(MemoryOutbox::new());
        let (_tx, d) = dispatcher(outbox.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(d.run(bus.subscribe(), cancel.clone()));

        bus.publish(alarm(1));
        bus.publish(alarm(1));
        bus.publish(ServerEvent::core(CoreEvent::Liveness(LivenessEvent {
            kind: LivenessKind::PeerDown,
            last_heartbeat_epoch: 10,
            power_state: PowerState::Off,
            epoch: 90_000,
        })));

        for _ in 0..50 {
            if outbox.sent().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.expect("dispatcher task");

        let subjects: Vec<String> = outbox.sent().into_iter().map(|m| m.subject).collect();
        assert_eq!(subjects.len(), 2);
        assert_eq!(subjects[1], "Server heartbeat lost");
    }
}

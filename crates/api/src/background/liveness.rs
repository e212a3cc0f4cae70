//! Periodic peer liveness check.
//!
//! Publishes a peer-down event when the peer has been silent past the
//! configured gap while last seen on battery power.

use std::sync::Arc;
use std::time::Duration;

use tankalarm_core::server::CoreEvent;
use tankalarm_core::types::now_epoch;
use tankalarm_events::EventBus;
use tokio_util::sync::CancellationToken;

use crate::state::SharedCore;

/// Run the liveness check loop until `cancel` is triggered.
pub async fn run(
    core: SharedCore,
    bus: Arc<EventBus>,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = every.as_secs(), "Liveness check started");

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Liveness check stopping");
                break;
            }
            _ = interval.tick() => {
                let mut guard = core.lock().await;
                match guard.check_liveness(now_epoch()) {
                    Some(event) => {
                        tracing::warn!(
                            last_heartbeat = event.last_heartbeat_epoch,
                            "Peer heartbeat overdue"
                        );
                        bus.publish_core([CoreEvent::Liveness(event)]);
                    }
                    None => tracing::debug!("Liveness check: peer healthy"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tankalarm_core::liveness::{LivenessKind, PowerState};
    use tankalarm_core::persist::MemoryBlobStore;
    use tankalarm_core::server::ServerCore;
    use tankalarm_events::bus::{EventBody, EVENT_PEER_DOWN};
    use tokio::sync::Mutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn silent_peer_on_battery_publishes_peer_down() {
        let mut engine = ServerCore::bootstrap(Box::new(MemoryBlobStore::new()), Some("7351"));
        let now = now_epoch();
        engine
            .record_heartbeat(now - 2 * 86_400, PowerState::Off, now)
            .expect("seed heartbeat");
        let core: SharedCore = Arc::new(Mutex::new(engine));

        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&core),
            Arc::clone(&bus),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event before timeout")
            .expect("bus open");
        assert_eq!(event.event_type, EVENT_PEER_DOWN);
        assert!(matches!(
            event.body,
            EventBody::Core(CoreEvent::Liveness(ref e)) if e.kind == LivenessKind::PeerDown
        ));
        assert!(core.lock().await.heartbeat().expect("checkpoint").down_notified);

        // Later ticks do not repeat the incident.
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.expect("task joins");
    }
}

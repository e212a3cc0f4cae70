//! Periodic sweep that moves silent tanks into failure.

use std::sync::Arc;
use std::time::Duration;

use tankalarm_core::server::CoreEvent;
use tankalarm_core::types::now_epoch;
use tankalarm_events::EventBus;
use tokio_util::sync::CancellationToken;

use crate::state::SharedCore;

/// Run the overdue sweep loop until `cancel` is triggered.
pub async fn run(
    core: SharedCore,
    bus: Arc<EventBus>,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = every.as_secs(), "Overdue sweep started");

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Overdue sweep stopping");
                break;
            }
            _ = interval.tick() => {
                let mut guard = core.lock().await;
                let failed = guard.sweep_overdue(now_epoch());
                if failed.is_empty() {
                    tracing::debug!("Overdue sweep: no silent tanks");
                } else {
                    tracing::warn!(count = failed.len(), "Overdue sweep: tanks marked failed");
                    bus.publish_core(failed.into_iter().map(CoreEvent::Alarm));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tankalarm_core::persist::MemoryBlobStore;
    use tankalarm_core::schema::{AlarmState, SyncRecord};
    use tankalarm_core::server::ServerCore;
    use tankalarm_events::bus::{EventBody, EVENT_ALARM};
    use tokio::sync::Mutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn silent_tank_is_published_as_failure() {
        let mut engine = ServerCore::bootstrap(Box::new(MemoryBlobStore::new()), Some("7351"));
        let now = now_epoch();
        let reading = SyncRecord {
            client_id: "C1".into(),
            tank_index: 0,
            height_inches: 30.0,
            level_inches: 30.0,
            percent: 50.0,
            vin_voltage: 12.7,
            epoch: now - 10 * 86_400,
        };
        engine.ingest(&reading, now).expect("seed reading");
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
        assert_eq!(event.event_type, EVENT_ALARM);
        match event.body {
            EventBody::Core(CoreEvent::Alarm(alarm)) => {
                assert_eq!((alarm.client_id.as_str(), alarm.tank_index), ("C1", 0));
                assert_eq!(alarm.to_state, AlarmState::Failure);
            }
            other => panic!("unexpected event body: {other:?}"),
        }
        assert_eq!(
            core.lock().await.get_record("C1", 0).expect("record").alarm_state,
            AlarmState::Failure
        );

        cancel.cancel();
        handle.await.expect("task joins");
    }
}

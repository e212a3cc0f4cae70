//! Daily report scheduler.
//!
//! [`DailyReportScheduler`] runs as a background task. It polls on a short
//! interval, and once the configured wall-clock time has passed it publishes a
//! [`DailyReport`] carrying the current viewer summary. Schedule changes made
//! through the config API take effect on the next poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tankalarm_core::config::DailyReportConfig;
use tankalarm_core::scheduling::next_aligned_epoch;
use tankalarm_core::schema::ViewerSummary;
use tankalarm_core::types::{now_epoch, Epoch};

use crate::bus::{DailyReport, EventBus, ServerEvent};

/// How often the scheduler checks whether a report is due.
const REPORT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Where the scheduler reads its schedule and the summary from.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn schedule(&self) -> DailyReportConfig;
    async fn summary(&self, now: Epoch) -> ViewerSummary;
}

pub struct DailyReportScheduler<S: ReportSource> {
    source: Arc<S>,
    bus: Arc<EventBus>,
    /// Next due time and the `(hour, minute)` it was computed for.
    next_due: Option<(Epoch, u8, u8)>,
}

impl<S: ReportSource> DailyReportScheduler<S> {
    pub fn new(source: Arc<S>, bus: Arc<EventBus>) -> Self {
        Self {
            source,
            bus,
            next_due: None,
        }
    }

    /// Next scheduled report time, once known.
    pub fn next_due(&self) -> Option<Epoch> {
        self.next_due.map(|(due, _, _)| due)
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(REPORT_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Daily report scheduler cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(now_epoch()).await;
                }
            }
        }
    }

    /// Publish a report if one is due at `now`.
    pub async fn tick(&mut self, now: Epoch) -> Option<DailyReport> {
        let schedule = self.source.schedule().await;
        let due = match self.next_due {
            Some((due, h, m)) if h == schedule.hour && m == schedule.minute => due,
            _ => {
                let due = next_aligned_epoch(now, schedule.hour, schedule.minute);
                tracing::debug!(due, "Daily report scheduled");
                self.next_due = Some((due, schedule.hour, schedule.minute));
                due
            }
        };
        if now < due {
            return None;
        }

        let next = next_aligned_epoch(now, schedule.hour, schedule.minute);
        self.next_due = Some((next, schedule.hour, schedule.minute));
        if !schedule.enabled {
            tracing::debug!(due, "Daily report disabled, skipping");
            return None;
        }

        let report = DailyReport {
            due_epoch: due,
            summary: self.source.summary(now).await,
        };
        tracing::info!(
            due,
            tanks = report.summary.tank_count,
            alarms = report.summary.alarm_count,
            "Daily report published"
        );
        self.bus.publish(ServerEvent::daily_report(report.clone()));
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bus::EventBody;

    const MIDNIGHT: Epoch = 1_699_920_000;

    struct FixedSource {
        schedule: Mutex<DailyReportConfig>,
    }

    #[async_trait]
    impl ReportSource for FixedSource {
        async fn schedule(&self) -> DailyReportConfig {
            *self.schedule.lock().expect("lock")
        }

        async fn summary(&self, now: Epoch) -> ViewerSummary {
            ViewerSummary {
                server_name: "Test".into(),
                location: String::new(),
                generated_at: now,
                tank_count: 0,
                alarm_count: 0,
                tanks: vec![],
            }
        }
    }

    fn source(enabled: bool) -> Arc<FixedSource> {
        Arc::new(FixedSource {
            schedule: Mutex::new(DailyReportConfig {
                enabled,
                hour: 5,
                minute: 0,
            }),
        })
    }

    #[tokio::test]
    async fn publishes_once_per_day_at_configured_time() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let mut scheduler = DailyReportScheduler::new(source(true), Arc::clone(&bus));

        let due = MIDNIGHT + 5 * 3600;
        assert!(scheduler.tick(MIDNIGHT + 3600).await.is_none());
        assert_eq!(scheduler.next_due(), Some(due));

        let report = scheduler.tick(due + 30).await.expect("due");
        assert_eq!(report.due_epoch, due);
        assert!(scheduler.tick(due + 90).await.is_none(), "only once");
        assert_eq!(scheduler.next_due(), Some(due + 86_400));

        let event = rx.recv().await.expect("published");
        assert!(matches!(event.body, EventBody::DailyReport(ref r) if r.due_epoch == due));
    }

    #[tokio::test]
    async fn disabled_schedule_advances_without_publishing() {
        let bus = Arc::new(EventBus::default());
        let mut scheduler = DailyReportScheduler::new(source(false), bus);
        scheduler.tick(MIDNIGHT).await;
        assert!(scheduler.tick(MIDNIGHT + 5 * 3600).await.is_none());
        assert_eq!(scheduler.next_due(), Some(MIDNIGHT + 86_400 + 5 * 3600));
    }

    #[tokio::test]
    async fn schedule_change_recomputes_due_time() {
        let bus = Arc::new(EventBus::default());
        let src = source(true);
        let mut scheduler = DailyReportScheduler::new(Arc::clone(&src), bus);
        scheduler.tick(MIDNIGHT).await;
        assert_eq!(scheduler.next_due(), Some(MIDNIGHT + 5 * 3600));

        src.schedule.lock().expect("lock").hour = 7;
        scheduler.tick(MIDNIGHT + 60).await;
        assert_eq!(scheduler.next_due(), Some(MIDNIGHT + 7 * 3600));
    }
}

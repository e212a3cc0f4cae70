//! Daily report source backed by the shared core.

use async_trait::async_trait;
use tankalarm_core::config::DailyReportConfig;
use tankalarm_core::schema::ViewerSummary;
use tankalarm_core::types::Epoch;
use tankalarm_events::ReportSource;

use crate::state::SharedCore;

/// Reads the report schedule and summary from the live core, so schedule
/// changes made through the config API apply without a restart.
pub struct CoreReportSource {
    core: SharedCore,
}

impl CoreReportSource {
    pub fn new(core: SharedCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ReportSource for CoreReportSource {
    async fn schedule(&self) -> DailyReportConfig {
        self.core.lock().await.site_config().daily_report
    }

    async fn summary(&self, now: Epoch) -> ViewerSummary {
        self.core.lock().await.summary(now)
    }
}

use crate::config::SiteInfo;
use crate::schema::{TankSummary, ViewerSummary};
use crate::store::TankRecordStore;
use crate::types::Epoch;

/// Project every record into the viewer summary, sorted by client and tank.
pub fn build_summary(store: &TankRecordStore, site: &SiteInfo, now: Epoch) -> ViewerSummary {
    let mut tanks: Vec<TankSummary> = store.all().map(TankSummary::from).collect();
    tanks.sort_by(|a, b| {
        a.client_id
            .cmp(&b.client_id)
            .then(a.tank_index.cmp(&b.tank_index))
    });
    let alarm_count = tanks.iter().filter(|t| t.alarm_state.is_alarm()).count();
    ViewerSummary {
        server_name: site.server_name.clone(),
        location: site.location.clone(),
        generated_at: now,
        tank_count: tanks.len(),
        alarm_count,
        tanks,
    }
}

use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tankalarm_core::auth::GuardState;
use tankalarm_core::server::CoreStats;
use tankalarm_core::types::now_epoch;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// Some state could not be persisted and lives only in memory.
    degraded: bool,
    admin: GuardState,
    stats: CoreStats,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let core = state.core.lock().await;
    let degraded = core.is_degraded();
    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        degraded,
        admin: core.auth_state(now_epoch()),
        stats: core.stats(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

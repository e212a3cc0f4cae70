//! Handlers for the relay transport (sync records and heartbeats).

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use tankalarm_core::liveness::PowerState;
use tankalarm_core::server::{CoreEvent, HeartbeatRecorded, SyncOutcome};
use tankalarm_core::types::{now_epoch, Epoch};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for the heartbeat endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub epoch: Epoch,
    #[serde(default)]
    pub power_state: PowerState,
}

/// POST /api/v1/sync
///
/// Ingest one raw sync record. The body is parsed by the core so that the
/// payload size limit applies to the bytes as received. Events are published
/// before the core lock is released so they reach the bus in state order.
pub async fn ingest_sync(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<DataResponse<SyncOutcome>>> {
    let mut core = state.core.lock().await;
    let outcome = core.ingest_bytes(&body, now_epoch())?;
    state.event_bus.publish_core(outcome.events.iter().cloned());
    drop(core);

    tracing::debug!(
        client_id = %outcome.report.client_id,
        tank_index = outcome.report.tank_index,
        applied = ?outcome.report.applied,
        events = outcome.events.len(),
        "Sync record ingested"
    );

    Ok(Json(DataResponse { data: outcome }))
}

/// POST /api/v1/heartbeat
pub async fn record_heartbeat(
    State(state): State<AppState>,
    Json(input): Json<HeartbeatRequest>,
) -> AppResult<Json<DataResponse<HeartbeatRecorded>>> {
    let mut core = state.core.lock().await;
    let recorded = core.record_heartbeat(input.epoch, input.power_state, now_epoch())?;
    if let Some(event) = &recorded.event {
        state.event_bus.publish_core([CoreEvent::Liveness(event.clone())]);
    }
    drop(core);

    Ok(Json(DataResponse { data: recorded }))
}

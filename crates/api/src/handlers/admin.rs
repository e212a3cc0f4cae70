//! Handlers for the local admin surface.
//!
//! Every handler requires [`LocalAdmin`]. Config writes additionally carry the
//! admin PIN in the `x-admin-pin` header.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tankalarm_core::config::{ConfigUpdate, RedactedConfig};
use tankalarm_core::schema::TankRecord;
use tankalarm_core::server::ConfigApplied;
use tankalarm_core::types::{now_epoch, Epoch};

use crate::error::AppResult;
use crate::middleware::local::LocalAdmin;
use crate::response::DataResponse;
use crate::state::AppState;

/// Header carrying the admin PIN on config writes.
pub const ADMIN_PIN_HEADER: &str = "x-admin-pin";

#[derive(Deserialize)]
pub struct AuthRequest {
    pub pin: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub authenticated: bool,
    pub epoch: Epoch,
}

/// POST /api/v1/auth
pub async fn authenticate(
    State(state): State<AppState>,
    LocalAdmin(peer): LocalAdmin,
    Json(input): Json<AuthRequest>,
) -> AppResult<Json<DataResponse<AuthResponse>>> {
    let result = state
        .core
        .lock()
        .await
        .authenticate(input.pin.as_bytes(), now_epoch());

    match result {
        Ok(authorized) => {
            tracing::info!(peer = ?peer, "Admin authenticated");
            Ok(Json(DataResponse {
                data: AuthResponse {
                    authenticated: true,
                    epoch: authorized.epoch,
                },
            }))
        }
        Err(e) => {
            tracing::warn!(peer = ?peer, error = %e, "Admin authentication refused");
            Err(e.into())
        }
    }
}

/// GET /api/v1/records
pub async fn list_records(
    State(state): State<AppState>,
    LocalAdmin(_peer): LocalAdmin,
) -> AppResult<Json<DataResponse<Vec<TankRecord>>>> {
    let records = state.core.lock().await.list_records();
    Ok(Json(DataResponse { data: records }))
}

/// GET /api/v1/records/{client_id}/{tank_index}
pub async fn get_record(
    State(state): State<AppState>,
    LocalAdmin(_peer): LocalAdmin,
    Path((client_id, tank_index)): Path<(String, u8)>,
) -> AppResult<Json<DataResponse<TankRecord>>> {
    let record = state.core.lock().await.get_record(&client_id, tank_index)?;
    Ok(Json(DataResponse { data: record }))
}

/// GET /api/v1/config
///
/// The admin PIN is never included, only whether one is set.
pub async fn get_config(
    State(state): State<AppState>,
    LocalAdmin(_peer): LocalAdmin,
) -> AppResult<Json<DataResponse<RedactedConfig>>> {
    let config = state.core.lock().await.config_view();
    Ok(Json(DataResponse { data: config }))
}

/// PUT /api/v1/config
///
/// Authenticates with the `x-admin-pin` header, then validates and applies the
/// update as a whole. A missing header is treated as an empty PIN and counts
/// as a failed attempt.
pub async fn update_config(
    State(state): State<AppState>,
    LocalAdmin(peer): LocalAdmin,
    headers: HeaderMap,
    Json(update): Json<ConfigUpdate>,
) -> AppResult<Json<DataResponse<ConfigApplied>>> {
    let pin = headers
        .get(ADMIN_PIN_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    let (applied, contacts) = {
        let mut core = state.core.lock().await;
        let applied = core.update_config(pin, update, now_epoch())?;
        (applied, core.site_config().contacts.clone())
    };

    state.contacts.send_replace(contacts);
    tracing::info!(peer = ?peer, durable = applied.durable, "Config updated via API");
    Ok(Json(DataResponse { data: applied }))
}

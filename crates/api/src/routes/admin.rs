//! Route definitions for the local admin surface.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::admin;
use crate::state::AppState;

/// Admin routes. Every handler takes the `LocalAdmin` extractor.
///
/// ```text
/// POST /auth                              -> authenticate
/// GET  /records                           -> list_records
/// GET  /records/{client_id}/{tank_index}  -> get_record
/// GET  /config                            -> get_config
/// PUT  /config                            -> update_config
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth", post(admin::authenticate))
        .route("/records", get(admin::list_records))
        .route("/records/{client_id}/{tank_index}", get(admin::get_record))
        .route(
            "/config",
            get(admin::get_config).put(admin::update_config),
        )
}

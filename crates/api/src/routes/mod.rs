pub mod admin;
pub mod health;
pub mod relay;

use axum::routing::get;
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /sync                                   relay sync record (POST)
/// /heartbeat                              relay heartbeat (POST)
///
/// /auth                                   verify the admin PIN (local)
/// /records                                list tank records (local)
/// /records/{client_id}/{tank_index}       one tank record (local)
/// /config                                 get, update site config (local)
///
/// /summary                                viewer summary (public)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(relay::router())
        .merge(admin::router())
        .route("/summary", get(handlers::viewer::get_summary))
}

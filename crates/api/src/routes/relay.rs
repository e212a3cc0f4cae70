//! Route definitions for the relay transport.

use axum::routing::post;
use axum::Router;

use crate::handlers::relay;
use crate::state::AppState;

/// Relay routes. No authentication: the relay is the only writer.
///
/// ```text
/// POST /sync        -> ingest_sync
/// POST /heartbeat   -> record_heartbeat
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(relay::ingest_sync))
        .route("/heartbeat", post(relay::record_heartbeat))
}

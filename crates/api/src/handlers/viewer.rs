use axum::extract::State;
use axum::Json;
use tankalarm_core::schema::ViewerSummary;
use tankalarm_core::types::now_epoch;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/summary
///
/// Read-only site summary for viewer kiosks. Unauthenticated.
pub async fn get_summary(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<ViewerSummary>>> {
    let summary = state.core.lock().await.summary(now_epoch());
    Ok(Json(DataResponse { data: summary }))
}

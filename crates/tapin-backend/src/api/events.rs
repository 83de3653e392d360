//! Scan events and the attendance log.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use tapin_core::backend::{EventRequest, EventResponse};

use crate::api::auth::bearer;
use crate::api::error::{ApiError, ApiResult};
use crate::state::{AttendanceRecord, SharedState};

/// Record one scan.
///
/// The response names the badge holder (empty if not on the roster) and
/// says whether the scan was an entry or an exit.
pub async fn post_event(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<EventRequest>,
) -> ApiResult<Json<EventResponse>> {
    let token = bearer(&headers)?;
    if request.tag_id.trim().is_empty() {
        return Err(ApiError::BadRequest {
            error_code: "empty_tag".to_string(),
            message: "tag_id must not be empty".to_string(),
        });
    }

    let response = state
        .registry_mut()
        .await
        .record_event(token, &request, Utc::now())?;
    Ok(Json(response))
}

/// Recorded scans, oldest first.
pub async fn list_attendance(State(state): State<SharedState>) -> Json<Vec<AttendanceRecord>> {
    Json(state.registry().await.attendance().to_vec())
}

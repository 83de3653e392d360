//! Reader registration, heartbeats and the device list.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use tapin_core::backend::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse};

use crate::api::auth::bearer;
use crate::api::error::ApiResult;
use crate::state::{DeviceSummary, Issued, SharedState};

/// Register a reader.
///
/// 201 with a credential for a new reader, 200 with a fresh credential for
/// one that is already registered, 403 for a wrong provisioning secret.
pub async fn register(
    State(state): State<SharedState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let issued = state.registry_mut().await.register(&request, Utc::now())?;
    Ok(match issued {
        Issued::New(response) => (StatusCode::CREATED, Json(response)),
        Issued::Reissued(response) => (StatusCode::OK, Json(response)),
    })
}

/// Accept a liveness report and answer with the server time.
pub async fn heartbeat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let token = bearer(&headers)?;
    let response = state
        .registry_mut()
        .await
        .heartbeat(token, &request, Utc::now())?;
    Ok(Json(response))
}

/// Every registered reader with its latest heartbeat.
pub async fn list_devices(State(state): State<SharedState>) -> Json<Vec<DeviceSummary>> {
    Json(state.registry().await.devices())
}

//! HTTP API routes and handlers.
//!
//! - `devices` - reader registration, heartbeats, device list
//! - `events` - scan events and the attendance log
//! - `health` - service health checks
//! - `auth` - bearer credential extraction
//! - `error` - API error types

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod auth;
pub mod devices;
pub mod error;
pub mod events;
pub mod health;

pub use error::{ApiError, ApiResult, ErrorResponse};

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health          - Health check
/// /register        - Reader registration (reader contract)
/// /event           - Scan events (reader contract)
/// /heartbeat       - Reader heartbeats (reader contract)
/// /api
/// ├── /devices     - Registered readers
/// └── /attendance  - Attendance log
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/register", post(devices::register))
        .route("/event", post(events::post_event))
        .route("/heartbeat", post(devices::heartbeat))
        .nest(
            "/api",
            Router::new()
                .route("/devices", get(devices::list_devices))
                .route("/attendance", get(events::list_attendance)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

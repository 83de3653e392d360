//! Liveness endpoint.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::state::SharedState;

/// `GET /health` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok` while the process serves requests.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// Registered readers.
    pub devices: usize,
    /// Scans recorded since start.
    pub scans: usize,
}

pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let registry = state.registry().await;
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        devices: registry.devices().len(),
        scans: registry.attendance().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::Config;
    use crate::state::AppState;

    #[tokio::test]
    async fn test_empty_backend_is_healthy() {
        let config = Config {
            addr: "127.0.0.1:0".parse().unwrap(),
            provisioning_secret: "s3cret".into(),
            token_ttl: chrono::Duration::hours(1),
            roster: HashMap::new(),
            production: false,
        };
        let Json(health) = health_check(State(AppState::new(&config))).await;
        assert_eq!(health.status, "ok");
        assert_eq!((health.devices, health.scans), (0, 0));
    }
}

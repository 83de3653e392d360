//! HTTP contract with the attendance backend.
//!
//! ```text
//! POST /register   device id + provisioning secret  -> 201 new / 200 reissued
//! POST /event      bearer; tag, timestamp, rssi      -> 200 name + kind, 401
//! POST /heartbeat  bearer; version, depth, counters  -> 200 server time
//! ```
//!
//! The [`Backend`] trait is the seam between the network task and the wire;
//! [`HttpBackend`] is the production implementation.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::link::ErrorCounters;

/// Errors talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// No HTTP response (connect, DNS, timeout).
    #[error("transport: {0}")]
    Transport(String),

    /// HTTP 401: the bearer credential is no longer valid.
    #[error("credential rejected")]
    Unauthorized,

    /// HTTP 403: the provisioning secret does not match.
    #[error("provisioning secret rejected")]
    Forbidden,

    /// Any other non-success status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// The response body did not match the contract.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The base URL cannot be combined with a contract path.
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

/// `POST /register` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Stable device identifier.
    pub device_id: String,
    /// Provisioning secret.
    pub secret: String,
    /// Display name.
    pub name: String,
    /// Mounting location.
    pub location: String,
}

/// `POST /register` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Bearer credential.
    pub token: String,
    /// Credential expiry, RFC 3339.
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// A successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Issued credential and expiry.
    pub response: RegisterResponse,
    /// The device was already known (HTTP 200 rather than 201).
    pub reissued: bool,
}

/// `POST /event` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRequest {
    /// Reporting device.
    pub device_id: String,
    /// Tag identifier.
    pub tag_id: String,
    /// ISO-8601, empty if the reader clock was unsynced.
    pub timestamp: String,
    /// Signal strength in dBm.
    pub rssi: i16,
}

/// `POST /event` response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResponse {
    /// Recognized identity.
    #[serde(default)]
    pub name: String,
    /// Advisory classification (`entry`, `exit`, ...).
    #[serde(default)]
    pub kind: String,
}

/// `POST /heartbeat` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Reporting device.
    pub device_id: String,
    /// Running firmware.
    pub firmware_version: String,
    /// Events awaiting delivery.
    pub buffer_depth: usize,
    /// Seconds since boot.
    pub uptime_secs: u64,
    /// Free heap in bytes, 0 if unknown.
    pub free_memory: u64,
    /// Accumulated error counters.
    pub counters: ErrorCounters,
}

/// `POST /heartbeat` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Backend wall time, RFC 3339.
    pub server_time: String,
}

/// The attendance backend as seen by the network task.
pub trait Backend: Send + Sync + 'static {
    /// Register (or re-register) the device.
    fn register(
        &self,
        request: &RegisterRequest,
    ) -> impl Future<Output = Result<Registration, BackendError>> + Send;

    /// Deliver one scan event.
    fn post_event(
        &self,
        token: &str,
        request: &EventRequest,
    ) -> impl Future<Output = Result<EventResponse, BackendError>> + Send;

    /// Report liveness and diagnostics.
    fn heartbeat(
        &self,
        token: &str,
        request: &HeartbeatRequest,
    ) -> impl Future<Output = Result<HeartbeatResponse, BackendError>> + Send;
}

/// [`Backend`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    /// Create a client for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        // Contract paths are joined relative to the base path.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tapin-reader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    /// Resolved base URL.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn post<B, T>(
        &self,
        path: &str,
        token: Option<&str>,
        body: &B,
    ) -> Result<(StatusCode, T), BackendError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))?;

        let mut request = self.client.post(url).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = response.status();
        debug!(path, status = status.as_u16(), "backend response");

        match status {
            StatusCode::UNAUTHORIZED => return Err(BackendError::Unauthorized),
            StatusCode::FORBIDDEN => return Err(BackendError::Forbidden),
            s if !s.is_success() => return Err(BackendError::Status(s.as_u16())),
            _ => {}
        }

        let body = response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok((status, body))
    }
}

impl Backend for HttpBackend {
    async fn register(&self, request: &RegisterRequest) -> Result<Registration, BackendError> {
        let (status, response) = self.post("register", None, request).await?;
        Ok(Registration {
            response,
            reissued: status == StatusCode::OK,
        })
    }

    async fn post_event(
        &self,
        token: &str,
        request: &EventRequest,
    ) -> Result<EventResponse, BackendError> {
        let (_, response) = self.post("event", Some(token), request).await?;
        Ok(response)
    }

    async fn heartbeat(
        &self,
        token: &str,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, BackendError> {
        let (_, response) = self.post("heartbeat", Some(token), request).await?;
        Ok(response)
    }
}

//! Application state shared across handlers.
//!
//! Everything is in memory: registered readers, their credentials, who is
//! currently inside, and the attendance log.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tapin_core::backend::{
    EventRequest, EventResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse,
};
use tapin_core::ErrorCounters;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;

/// Why the registry refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The provisioning secret does not match.
    #[error("provisioning secret mismatch")]
    SecretMismatch,

    /// Unknown, revoked or expired credential.
    #[error("invalid or expired credential")]
    InvalidCredential,

    /// The credential belongs to another reader.
    #[error("credential issued to {expected}, not {actual}")]
    DeviceMismatch {
        /// Reader the credential was issued to.
        expected: String,
        /// Reader named in the request.
        actual: String,
    },
}

/// Result of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issued {
    /// First registration of this reader.
    New(RegisterResponse),
    /// The reader was already registered; a fresh credential replaces the old one.
    Reissued(RegisterResponse),
}

/// One recorded scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// Reader that captured the scan.
    pub device_id: String,
    /// Badge tag id.
    pub tag_id: String,
    /// Roster name, empty if unknown.
    pub name: String,
    /// `entry` or `exit`.
    pub kind: String,
    /// Reader timestamp, or receipt time when the reader clock was unsynced.
    pub timestamp: String,
    /// When the backend received the scan.
    pub received_at: DateTime<Utc>,
}

/// Latest liveness report from a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Reader id.
    pub device_id: String,
    /// Display name.
    pub name: String,
    /// Installation location.
    pub location: String,
    /// Firmware version from the last heartbeat.
    pub firmware_version: Option<String>,
    /// Buffered scans at the last heartbeat.
    pub buffer_depth: Option<usize>,
    /// Counters from the last heartbeat.
    pub counters: Option<ErrorCounters>,
    /// Last heartbeat time.
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Device {
    token: String,
    expires_at: DateTime<Utc>,
    summary: DeviceSummary,
}

/// Readers, credentials, presence and the attendance log.
#[derive(Debug)]
pub struct Registry {
    secret: String,
    token_ttl: chrono::Duration,
    roster: HashMap<String, String>,
    devices: HashMap<String, Device>,
    tokens: HashMap<String, String>,
    inside: HashSet<String>,
    attendance: Vec<AttendanceRecord>,
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            secret: config.provisioning_secret.clone(),
            token_ttl: config.token_ttl,
            roster: config.roster.clone(),
            devices: HashMap::new(),
            tokens: HashMap::new(),
            inside: HashSet::new(),
            attendance: Vec::new(),
        }
    }

    /// Register a reader, reissuing a credential if it is already known.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SecretMismatch`] for a wrong secret.
    pub fn register(
        &mut self,
        request: &RegisterRequest,
        now: DateTime<Utc>,
    ) -> Result<Issued, RegistryError> {
        if request.secret != self.secret {
            warn!(device = %request.device_id, "registration with wrong secret");
            return Err(RegistryError::SecretMismatch);
        }

        let token = Uuid::new_v4().simple().to_string();
        let expires_at = now + self.token_ttl;
        let response = RegisterResponse {
            token: token.clone(),
            expires_at: Some(rfc3339(expires_at)),
        };
        self.tokens.insert(token.clone(), request.device_id.clone());

        if let Some(device) = self.devices.get_mut(&request.device_id) {
            self.tokens.remove(&device.token);
            device.token = token;
            device.expires_at = expires_at;
            device.summary.name.clone_from(&request.name);
            device.summary.location.clone_from(&request.location);
            info!(device = %request.device_id, "credential reissued");
            return Ok(Issued::Reissued(response));
        }

        self.devices.insert(
            request.device_id.clone(),
            Device {
                token,
                expires_at,
                summary: DeviceSummary {
                    device_id: request.device_id.clone(),
                    name: request.name.clone(),
                    location: request.location.clone(),
                    firmware_version: None,
                    buffer_depth: None,
                    counters: None,
                    last_seen: None,
                },
            },
        );
        info!(device = %request.device_id, "device registered");
        Ok(Issued::New(response))
    }

    /// Reader a live credential belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidCredential`] for an unknown or
    /// expired credential.
    pub fn authenticate(&self, token: &str, now: DateTime<Utc>) -> Result<&str, RegistryError> {
        let device_id = self
            .tokens
            .get(token)
            .ok_or(RegistryError::InvalidCredential)?;
        match self.devices.get(device_id) {
            Some(device) if device.expires_at > now => Ok(device_id.as_str()),
            _ => Err(RegistryError::InvalidCredential),
        }
    }

    fn authorize(
        &self,
        token: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let owner = self.authenticate(token, now)?;
        if owner == device_id {
            Ok(())
        } else {
            Err(RegistryError::DeviceMismatch {
                expected: owner.to_string(),
                actual: device_id.to_string(),
            })
        }
    }

    /// Record a scan, alternating entry and exit per tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is invalid or belongs to another reader.
    pub fn record_event(
        &mut self,
        token: &str,
        request: &EventRequest,
        now: DateTime<Utc>,
    ) -> Result<EventResponse, RegistryError> {
        self.authorize(token, &request.device_id, now)?;

        let kind = if self.inside.remove(&request.tag_id) {
            "exit"
        } else {
            self.inside.insert(request.tag_id.clone());
            "entry"
        };
        let name = self.roster.get(&request.tag_id).cloned().unwrap_or_default();
        let timestamp = if request.timestamp.is_empty() {
            rfc3339(now)
        } else {
            request.timestamp.clone()
        };

        debug!(device = %request.device_id, tag = %request.tag_id, kind, "scan recorded");
        self.attendance.push(AttendanceRecord {
            device_id: request.device_id.clone(),
            tag_id: request.tag_id.clone(),
            name: name.clone(),
            kind: kind.to_string(),
            timestamp,
            received_at: now,
        });

        Ok(EventResponse {
            name,
            kind: kind.to_string(),
        })
    }

    /// Store a liveness report and answer with the server time.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is invalid or belongs to another reader.
    pub fn heartbeat(
        &mut self,
        token: &str,
        request: &HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse, RegistryError> {
        self.authorize(token, &request.device_id, now)?;
        if let Some(device) = self.devices.get_mut(&request.device_id) {
            let summary = &mut device.summary;
            summary.firmware_version = Some(request.firmware_version.clone());
            summary.buffer_depth = Some(request.buffer_depth);
            summary.counters = Some(request.counters);
            summary.last_seen = Some(now);
        }
        Ok(HeartbeatResponse {
            server_time: rfc3339(now),
        })
    }

    /// Recorded scans, oldest first.
    #[must_use]
    pub fn attendance(&self) -> &[AttendanceRecord] {
        &self.attendance
    }

    /// Every registered reader.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceSummary> {
        let mut devices: Vec<DeviceSummary> =
            self.devices.values().map(|d| d.summary.clone()).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: RwLock<Registry>,
}

/// Handle passed to every handler.
pub type SharedState = AppState;

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry: RwLock::new(Registry::new(config)),
            }),
        }
    }

    /// Get read access to the registry.
    pub async fn registry(&self) -> tokio::sync::RwLockReadGuard<'_, Registry> {
        self.inner.registry.read().await
    }

    /// Get write access to the registry.
    pub async fn registry_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.registry.write().await
    }
}

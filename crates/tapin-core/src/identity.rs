//! Persisted device credential.
//!
//! The identity record survives reboots so a registered reader does not
//! re-register on every boot. It is read and written only by the network
//! task.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WifiProfile;
use crate::storage::{write_atomic, StorageError, StorageResult};

/// Bearer credential issued at registration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Secret presented on every request.
    pub token: String,

    /// When the backend says the credential lapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Everything the network task persists between boots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Current credential, if registered.
    #[serde(default)]
    pub credential: Option<Credential>,

    /// Last network joined successfully.
    #[serde(default)]
    pub remembered_profile: Option<WifiProfile>,
}

/// File-backed store for the [`IdentityRecord`].
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Store the record at `path`.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the record. A missing file yields an empty record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> StorageResult<IdentityRecord> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(IdentityRecord::default()),
            Err(source) => Err(StorageError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Persist the record atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn save(&self, record: &IdentityRecord) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path, &self.path.with_extension("json.tmp"), &bytes)
    }
}

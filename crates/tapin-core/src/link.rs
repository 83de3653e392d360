//! Connectivity state and error counters.
//!
//! [`LinkState`] lives for the device's uptime. Only the network task can
//! change it, through the single [`LinkStateWriter`]; everyone else holds a
//! [`LinkStateHandle`] and reads copies taken under the lock.
//!
//! The scan task cannot touch the counters; it records its own storage
//! failures in [`ScanFaults`], which the network task folds in every tick.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Link status as seen by the network task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    /// No link.
    #[default]
    Disconnected,
    /// Working through the profile list.
    Connecting,
    /// Joined a network.
    Connected,
}

/// Accumulated error counters, reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorCounters {
    /// Established links that were later lost.
    pub link_drops: u32,
    /// Backend requests that failed without a contract answer.
    pub transport_errors: u32,
    /// Events refused or evicted because the buffer was full.
    pub buffer_overflows: u32,
    /// Server times that could not be adopted.
    pub clock_sync_failures: u32,
    /// Bearer credentials rejected by the backend.
    pub credential_expirations: u32,
    /// Persistent storage operations that failed.
    pub storage_errors: u32,
    /// Buffered entries discarded by compaction.
    pub corrupt_entries_dropped: u32,
}

/// Process-wide link state.
#[derive(Debug, Clone, Default)]
pub struct LinkState {
    /// Current link status.
    pub connectivity: Connectivity,
    /// A credential is held.
    pub registered: bool,
    /// Events awaiting delivery, on flash and in memory.
    pub buffered: usize,
    /// SSID of the joined network.
    pub profile: Option<String>,
    /// Error counters.
    pub counters: ErrorCounters,
}

/// Read-only copy of [`LinkState`].
pub type LinkSnapshot = LinkState;

impl LinkState {
    /// Connected and holding a credential.
    #[must_use]
    pub const fn is_online(&self) -> bool {
        matches!(self.connectivity, Connectivity::Connected) && self.registered
    }
}

/// Create the writer/handle pair for a fresh link state.
#[must_use]
pub fn link_state() -> (LinkStateWriter, LinkStateHandle) {
    let shared = Arc::new(RwLock::new(LinkState::default()));
    (
        LinkStateWriter {
            shared: Arc::clone(&shared),
        },
        LinkStateHandle { shared },
    )
}

/// Exclusive write access, owned by the network task. Not `Clone`.
#[derive(Debug)]
pub struct LinkStateWriter {
    shared: Arc<RwLock<LinkState>>,
}

impl LinkStateWriter {
    /// Mutate the state under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut LinkState) -> R) -> R {
        let mut state = self.shared.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Bump one counter.
    pub fn count(&self, f: impl FnOnce(&mut ErrorCounters) -> &mut u32) {
        self.update(|state| {
            let counter = f(&mut state.counters);
            *counter = counter.saturating_add(1);
        });
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> LinkSnapshot {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move everything the scan task recorded into the counters.
    pub fn absorb(&self, faults: &ScanFaults) {
        let overflows = faults.buffer_overflows.swap(0, Ordering::Relaxed);
        let storage = faults.storage_errors.swap(0, Ordering::Relaxed);
        if overflows == 0 && storage == 0 {
            return;
        }
        self.update(|state| {
            let c = &mut state.counters;
            c.buffer_overflows = c.buffer_overflows.saturating_add(overflows);
            c.storage_errors = c.storage_errors.saturating_add(storage);
        });
    }
}

/// Failures on the scan task's direct-buffer path, pending aggregation.
#[derive(Debug, Default)]
pub struct ScanFaults {
    buffer_overflows: AtomicU32,
    storage_errors: AtomicU32,
}

impl ScanFaults {
    /// An event was refused or evicted because the buffer was full.
    pub fn record_overflow(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// A direct buffer write failed.
    pub fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared read-only access.
#[derive(Debug, Clone)]
pub struct LinkStateHandle {
    shared: Arc<RwLock<LinkState>>,
}

impl LinkStateHandle {
    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> LinkSnapshot {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

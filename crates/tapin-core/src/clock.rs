//! Wall clock synchronized from the backend.
//!
//! A reader has no trustworthy wall time until the backend has told it the
//! current time (heartbeat response). Until then scan events carry an empty
//! timestamp and the idle screen shows `--:--`.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::types::IsoTimestamp;

/// Shared clock, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SyncClock {
    offset: Arc<RwLock<Option<chrono::Duration>>>,
}

impl SyncClock {
    /// An unsynced clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that trusts the host's system time.
    #[must_use]
    pub fn host() -> Self {
        let clock = Self::new();
        clock.set_offset(chrono::Duration::zero());
        clock
    }

    /// Adopt `server_time` as the current time.
    pub fn sync_to(&self, server_time: DateTime<Utc>) {
        self.set_offset(server_time - Utc::now());
    }

    /// Returns `true` once the clock has been synced.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.offset
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Current time, if synced.
    #[must_use]
    pub fn now(&self) -> Option<DateTime<Utc>> {
        let offset = *self.offset.read().unwrap_or_else(PoisonError::into_inner);
        offset.map(|offset| Utc::now() + offset)
    }

    /// Current time as ISO-8601, empty if unsynced.
    #[must_use]
    pub fn iso_now(&self) -> IsoTimestamp {
        self.now().map_or_else(IsoTimestamp::new, |now| {
            IsoTimestamp::truncated(&now.to_rfc3339_opts(SecondsFormat::Secs, true))
        })
    }

    fn set_offset(&self, offset: chrono::Duration) {
        *self.offset.write().unwrap_or_else(PoisonError::into_inner) = Some(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsynced_clock_has_empty_timestamp() {
        let clock = SyncClock::new();
        assert!(!clock.is_synced());
        assert!(clock.now().is_none());
        assert!(clock.iso_now().is_empty());
    }

    #[test]
    fn test_sync_adopts_server_time() {
        let clock = SyncClock::new();
        let server = Utc::now() - chrono::Duration::hours(3);
        clock.sync_to(server);

        let now = clock.now().unwrap();
        let drift = (now - server).num_seconds().abs();
        assert!(drift < 5, "drift was {drift}s");
        assert!(clock.iso_now().as_str().ends_with('Z'));
    }

    #[test]
    fn test_clones_share_state() {
        let clock = SyncClock::new();
        let reader_side = clock.clone();
        clock.sync_to(Utc::now());
        assert!(reader_side.is_synced());
    }
}

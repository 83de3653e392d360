//! Scan events and their outcomes.

use serde::{Deserialize, Serialize};

use crate::bounded::Bounded;

/// Card tag identifier as reported by the reader.
pub type TagId = Bounded<32>;

/// ISO-8601 timestamp, empty while the clock is unsynced.
pub type IsoTimestamp = Bounded<32>;

/// Recognized identity shown to the badge holder.
pub type DisplayName = Bounded<32>;

/// A debounced badge presentation.
///
/// Created by the scan task and consumed once by the network task, which
/// either delivers it or persists it. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    /// Tag identifier.
    pub tag: TagId,

    /// When the badge was read. Empty if the clock was unsynced.
    pub timestamp: IsoTimestamp,

    /// Received signal strength in dBm.
    pub rssi: i16,

    /// Per-boot sequence number assigned by the scan task; zero for events
    /// not awaiting an outcome.
    #[serde(default)]
    pub seq: u64,
}

impl ScanEvent {
    /// Create an event, truncating `tag` to its fixed capacity.
    #[must_use]
    pub fn new(tag: &str, timestamp: IsoTimestamp, rssi: i16) -> Self {
        Self {
            tag: TagId::truncated(tag),
            timestamp,
            rssi,
            seq: 0,
        }
    }

    /// Tag the event with the scan task's sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

/// Advisory classification returned by the backend.
///
/// The reader never derives this itself; it only displays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Badge holder arrived.
    Entry,
    /// Badge holder left.
    Exit,
    /// No classification.
    #[default]
    Generic,
}

impl EventKind {
    /// Parse a backend classification. Unknown strings are `Generic`.
    #[must_use]
    pub fn from_backend(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" | "in" => Self::Entry,
            "exit" | "out" => Self::Exit,
            _ => Self::Generic,
        }
    }

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::Generic => "generic",
        }
    }
}

/// Result of handling one [`ScanEvent`], sent back to the scan task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    /// Sequence number of the event this answers.
    pub seq: u64,

    /// The backend acknowledged the event.
    pub success: bool,

    /// The event is held locally for later delivery.
    pub buffered: bool,

    /// Recognized identity, empty unless delivered.
    pub name: DisplayName,

    /// Backend classification.
    pub kind: EventKind,
}

impl EventOutcome {
    /// The backend acknowledged the event.
    #[must_use]
    pub fn delivered(seq: u64, name: &str, kind: EventKind) -> Self {
        Self {
            seq,
            success: true,
            buffered: false,
            name: DisplayName::truncated(name),
            kind,
        }
    }

    /// The event was held for later delivery.
    #[must_use]
    pub fn buffered(seq: u64) -> Self {
        Self {
            seq,
            success: false,
            buffered: true,
            name: DisplayName::new(),
            kind: EventKind::Generic,
        }
    }

    /// The event could be neither delivered nor held.
    #[must_use]
    pub fn failed(seq: u64) -> Self {
        Self {
            seq,
            success: false,
            buffered: false,
            name: DisplayName::new(),
            kind: EventKind::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_from_backend() {
        assert_eq!(EventKind::from_backend("entry"), EventKind::Entry);
        assert_eq!(EventKind::from_backend(" EXIT "), EventKind::Exit);
        assert_eq!(EventKind::from_backend("lunch"), EventKind::Generic);
        assert_eq!(EventKind::from_backend(""), EventKind::Generic);
    }

    #[test]
    fn test_scan_event_truncates_oversized_tag() {
        let tag = "F".repeat(100);
        let event = ScanEvent::new(&tag, IsoTimestamp::new(), -40);
        assert_eq!(event.tag.len(), TagId::CAPACITY);
    }

    #[test]
    fn test_outcome_constructors_are_exclusive() {
        let ok = EventOutcome::delivered(1, "Grace Hopper", EventKind::Entry);
        assert!(ok.success && !ok.buffered);

        let held = EventOutcome::buffered(2);
        assert!(!held.success && held.buffered);

        let lost = EventOutcome::failed(3);
        assert!(!lost.success && !lost.buffered);
        assert_eq!(lost.seq, 3);
    }

    #[test]
    fn test_scan_event_json_shape() {
        let timestamp = IsoTimestamp::truncated("2025-01-15T08:00:00Z");
        let event = ScanEvent::new("04A1B2C3", timestamp, -52);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"tag\":\"04A1B2C3\""));
        assert!(json.contains("\"rssi\":-52"));
    }

    #[test]
    fn test_scan_event_without_seq_deserializes() {
        let json = r#"{"tag":"04AA","timestamp":"","rssi":-60}"#;
        let event: ScanEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.seq, 0);
        assert_eq!(event.with_seq(9).seq, 9);
    }
}

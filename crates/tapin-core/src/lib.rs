//! # tapin-core
//!
//! Concurrency and reliability engine for tapin RFID attendance readers.
//!
//! A reader runs three cooperating tasks that talk only through bounded
//! queues:
//!
//! - the **scan task** polls the card reader, debounces repeat reads and
//!   hands off [`ScanEvent`]s,
//! - the **network task** owns connectivity, registration, delivery with
//!   retry, the offline buffer, heartbeats and maintenance,
//! - the **display task** renders state announcements and an idle screen.
//!
//! A [`Watchdog`] supervises all three and asks a [`RestartHandler`] to
//! restart the device when any of them stops checkpointing.
//!
//! ## Architecture
//!
//! - [`backend`] - HTTP contract with the attendance backend
//! - [`bounded`] - fixed-capacity strings with truncation
//! - [`bus`] - named peripheral locks with bounded acquisition
//! - [`clock`] - wall clock synchronized from the backend
//! - [`config`] - reader configuration loading, saving and validation
//! - [`display`] - display task and screen model
//! - [`error`] - unified error types for the crate
//! - [`identity`] - persisted device credential
//! - [`link`] - connectivity state and error counters
//! - [`network`] - network task
//! - [`retry`] - exponential backoff
//! - [`runtime`] - assembling tasks and placing them on cores
//! - [`scan`] - scan task and debouncing
//! - [`storage`] - flash-backed event buffer
//! - [`types`] - scan events and outcomes
//! - [`watchdog`] - task checkpoint supervision
//! - [`wifi`] - prioritized network profile reconnection

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod backend;
pub mod bounded;
pub mod bus;
pub mod clock;
pub mod config;
pub mod display;
pub mod error;
pub mod identity;
pub mod link;
pub mod network;
pub mod retry;
pub mod runtime;
pub mod scan;
pub mod storage;
pub mod types;
pub mod watchdog;
pub mod wifi;

// Re-export primary types for convenience
pub use backend::{Backend, BackendError, HttpBackend};
pub use bounded::Bounded;
pub use bus::BusLock;
pub use clock::SyncClock;
pub use config::{ConfigError, ConfigResult, OverflowPolicy, ReaderConfig, WifiProfile};
pub use display::{Display, DisplayMessage, DisplayTask, Screen};
pub use error::{Result, TapinError};
pub use identity::{Credential, IdentityRecord, IdentityStore};
pub use link::{Connectivity, ErrorCounters, LinkSnapshot, LinkStateHandle, ScanFaults};
pub use network::{NetworkChannels, NetworkTask};
pub use runtime::{assemble, spawn, Hardware, ReaderHandle, Tasks};
pub use scan::{CardReader, Cue, Debouncer, Feedback, ScanTask, TagRead};
pub use storage::{BufferedEvent, EventBuffer, PushOutcome, SharedBuffer, Storage, StorageError};
pub use types::{EventKind, EventOutcome, ScanEvent, TagId};
pub use watchdog::{RestartHandler, StallReport, Watchdog, WatchdogToken};
pub use wifi::{LinkManager, WifiLink};

//! # tapin-backend
//!
//! Reference attendance backend for tapin readers.
//!
//! It implements the small HTTP contract readers speak (registration with
//! idempotent credential reissue, scan events with entry/exit
//! classification, heartbeats with server time) over in-memory state. It is
//! what the reader integration tests and local development run against.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod config;
pub mod logging;
pub mod state;

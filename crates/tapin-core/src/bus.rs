//! Named peripheral locks.
//!
//! Every physically shared bus (card reader transport, display transport,
//! persistent storage) sits behind its own [`BusLock`]. Acquisition is always
//! bounded so a wedged holder shows up as a [`TapinError::LockTimeout`]
//! rather than a silent hang; the watchdog covers the rest.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Result, TapinError};

/// A peripheral guarded by a mutex with bounded acquisition.
#[derive(Debug)]
pub struct BusLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> BusLock<T> {
    /// Wrap `peripheral` in a lock called `name`.
    pub fn new(name: &'static str, peripheral: T) -> Self {
        Self {
            name,
            inner: Mutex::new(peripheral),
        }
    }

    /// Acquire the lock, giving up after `timeout`.
    ///
    /// Hold the guard for a single operation only, never across a network
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`TapinError::LockTimeout`] if the lock stays held.
    pub async fn acquire(&self, timeout: Duration) -> Result<MutexGuard<'_, T>> {
        tokio::time::timeout(timeout, self.inner.lock())
            .await
            .map_err(|_| {
                tracing::warn!(lock = self.name, ?timeout, "lock acquisition timed out");
                TapinError::LockTimeout(self.name)
            })
    }
}

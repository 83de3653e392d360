//! Prioritized network profile reconnection.
//!
//! The radio is polled for link state instead of delivering callbacks, so
//! every suspension point is an explicit, bounded await inside the network
//! task.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{WifiConfig, WifiProfile};
use crate::error::{Result, TapinError};
use crate::watchdog::WatchdogToken;

/// The radio link.
pub trait WifiLink: Send + 'static {
    /// Poll whether the link is currently up.
    fn is_connected(&mut self) -> impl Future<Output = bool> + Send;

    /// Try to join `profile` once.
    fn connect(&mut self, profile: &WifiProfile) -> impl Future<Output = Result<()>> + Send;
}

/// Walks the known profiles in priority order until one connects.
#[derive(Debug)]
pub struct LinkManager<W> {
    link: W,
    profiles: Vec<WifiProfile>,
    attempts_per_profile: u32,
    connect_timeout: Duration,
    watchdog: Option<WatchdogToken>,
}

impl<W: WifiLink> LinkManager<W> {
    /// Manage `link` with the configured profiles.
    pub fn new(link: W, config: &WifiConfig) -> Self {
        Self {
            link,
            profiles: config.networks.clone(),
            attempts_per_profile: config.attempts_per_profile.max(1),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            watchdog: None,
        }
    }

    /// Checkpoint `watchdog` before every join attempt.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: WatchdogToken) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Poll the link.
    pub async fn is_connected(&mut self) -> bool {
        self.link.is_connected().await
    }

    /// Configured profiles, then `remembered` unless it is one of them.
    #[must_use]
    pub fn candidates(&self, remembered: Option<&WifiProfile>) -> Vec<WifiProfile> {
        let mut candidates = self.profiles.clone();
        if let Some(remembered) = remembered {
            if !candidates.iter().any(|p| p.ssid == remembered.ssid) {
                candidates.push(remembered.clone());
            }
        }
        candidates
    }

    /// Try every candidate, `attempts_per_profile` times each.
    ///
    /// # Errors
    ///
    /// Returns [`TapinError::LinkUnavailable`] when every attempt failed.
    pub async fn reconnect(&mut self, remembered: Option<&WifiProfile>) -> Result<WifiProfile> {
        let mut attempts = 0;
        for profile in self.candidates(remembered) {
            for attempt in 1..=self.attempts_per_profile {
                attempts += 1;
                if let Some(watchdog) = &self.watchdog {
                    watchdog.checkpoint();
                }
                debug!(ssid = %profile.ssid, attempt, "joining network");
                match tokio::time::timeout(self.connect_timeout, self.link.connect(&profile)).await
                {
                    Ok(Ok(())) => {
                        info!(ssid = %profile.ssid, attempt, "joined network");
                        return Ok(profile);
                    }
                    Ok(Err(e)) => warn!(ssid = %profile.ssid, attempt, error = %e, "join failed"),
                    Err(_) => warn!(ssid = %profile.ssid, attempt, "join timed out"),
                }
            }
        }
        Err(TapinError::LinkUnavailable { attempts })
    }
}

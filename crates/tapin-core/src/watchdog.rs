//! Task checkpoint supervision.
//!
//! Each task holds a [`WatchdogToken`] and calls [`WatchdogToken::checkpoint`]
//! at least once per timeout. The supervisor loop in [`Watchdog::supervise`]
//! notices a task that went silent and hands a [`StallReport`] to the
//! [`RestartHandler`]. There is no in-task recovery: once a task has stopped
//! checkpointing, restarting the device is the only trustworthy response.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::WatchdogConfig;

/// Restarts the device.
pub trait RestartHandler: Send + Sync + 'static {
    /// Called once, with the first stalled task.
    fn restart(&self, report: &StallReport);
}

/// Which task stalled, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    /// Name the task registered under.
    pub task: &'static str,
    /// Time since its last checkpoint.
    pub silent_for: Duration,
}

#[derive(Debug)]
struct Slot {
    name: &'static str,
    last_checkpoint_ms: AtomicU64,
}

/// Handle a supervised task checkpoints through.
#[derive(Debug, Clone)]
pub struct WatchdogToken {
    slot: Arc<Slot>,
    origin: Instant,
}

impl WatchdogToken {
    /// Prove the task is still making progress.
    pub fn checkpoint(&self) {
        self.slot
            .last_checkpoint_ms
            .store(elapsed_ms(self.origin), Ordering::Release);
    }

    /// Name the task registered under.
    #[must_use]
    pub fn task(&self) -> &'static str {
        self.slot.name
    }
}

/// The supervisor.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    check_interval: Duration,
    origin: Instant,
    slots: Vec<Arc<Slot>>,
}

impl Watchdog {
    /// Supervisor configured from `config`.
    #[must_use]
    pub fn new(config: &WatchdogConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            check_interval: Duration::from_millis(config.check_interval_ms),
            origin: Instant::now(),
            slots: Vec::new(),
        }
    }

    /// Supervise a task named `name`, counting it as alive from now.
    pub fn register(&mut self, name: &'static str) -> WatchdogToken {
        let slot = Arc::new(Slot {
            name,
            last_checkpoint_ms: AtomicU64::new(elapsed_ms(self.origin)),
        });
        self.slots.push(Arc::clone(&slot));
        WatchdogToken {
            slot,
            origin: self.origin,
        }
    }

    /// The first task silent for longer than the timeout, if any.
    #[must_use]
    pub fn check(&self) -> Option<StallReport> {
        let now = elapsed_ms(self.origin);
        self.slots.iter().find_map(|slot| {
            let last = slot.last_checkpoint_ms.load(Ordering::Acquire);
            let silent_for = Duration::from_millis(now.saturating_sub(last));
            (silent_for > self.timeout).then_some(StallReport {
                task: slot.name,
                silent_for,
            })
        })
    }

    /// Check every interval until a task stalls, then restart once.
    pub async fn supervise<H: RestartHandler>(self, handler: H) -> StallReport {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(report) = self.check() {
                error!(
                    task = report.task,
                    silent_ms = u64::try_from(report.silent_for.as_millis()).unwrap_or(u64::MAX),
                    "task stopped checkpointing, restarting"
                );
                handler.restart(&report);
                return report;
            }
            debug!(tasks = self.slots.len(), "watchdog check passed");
        }
    }
}

fn elapsed_ms(origin: Instant) -> u64 {
    u64::try_from(origin.elapsed().as_millis()).unwrap_or(u64::MAX)
}

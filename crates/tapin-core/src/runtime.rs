//! Assembling the tasks and placing them on cores.
//!
//! ```text
//! scan core     ─ scan task (polled first) + display task
//! network core  ─ network task
//! supervisor    ─ watchdog
//! ```
//!
//! Each core is an OS thread driving a single-threaded runtime, so the two
//! tasks sharing the scan core interleave cooperatively and the scan task is
//! always polled before the display task.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::backend::Backend;
use crate::clock::SyncClock;
use crate::config::ReaderConfig;
use crate::display::{Display, DisplayTask};
use crate::error::Result;
use crate::identity::IdentityStore;
use crate::link::{link_state, LinkSnapshot, LinkStateHandle, ScanFaults};
use crate::network::{NetworkChannels, NetworkTask};
use crate::scan::{CardReader, Feedback, ScanTask};
use crate::storage::{EventBuffer, Storage};
use crate::watchdog::{RestartHandler, Watchdog};
use crate::wifi::WifiLink;

/// The peripherals a reader is built from.
pub struct Hardware<R, F, D, W> {
    /// Card reader on the reader bus.
    pub reader: R,
    /// LED and buzzer.
    pub feedback: F,
    /// Display panel.
    pub display: D,
    /// Radio link.
    pub wifi: W,
    /// Wall clock, unsynced until the first heartbeat unless the host has one.
    pub clock: SyncClock,
}

/// Every task, wired together but not yet running.
pub struct Tasks<R, F, D, B, W> {
    /// Scan task.
    pub scan: ScanTask<R, F>,
    /// Network task.
    pub network: NetworkTask<B, W>,
    /// Display task.
    pub display: DisplayTask<D>,
    /// Supervisor with all three tasks registered.
    pub watchdog: Watchdog,
    /// Read-only link state.
    pub link: LinkStateHandle,
    /// Shared wall clock.
    pub clock: SyncClock,
}

/// Create the queues, open the event buffer and build every task.
///
/// # Errors
///
/// Returns an error if the event buffer cannot be opened.
pub fn assemble<R, F, D, W, B>(
    config: &ReaderConfig,
    hardware: Hardware<R, F, D, W>,
    backend: B,
    storage: &Storage,
) -> Result<Tasks<R, F, D, B, W>>
where
    R: CardReader,
    F: Feedback,
    D: Display,
    W: WifiLink,
    B: Backend,
{
    let buffer = EventBuffer::open(
        storage.buffer_dir(),
        config.buffer.capacity,
        config.buffer.overflow_policy,
    )?
    .shared();

    let capacity = config.timing.queue_capacity.max(1);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (outcome_tx, outcome_rx) = mpsc::channel(capacity);
    let (display_tx, display_rx) = mpsc::channel(capacity);

    let (state, link) = link_state();
    let scan_faults = Arc::new(ScanFaults::default());
    let mut watchdog = Watchdog::new(&config.watchdog);
    let clock = hardware.clock;

    let scan = ScanTask::new(
        hardware.reader,
        hardware.feedback,
        clock.clone(),
        event_tx,
        outcome_rx,
        display_tx.clone(),
        Arc::clone(&buffer),
        Arc::clone(&scan_faults),
        watchdog.register("scan"),
        config.timing.clone(),
    );

    let network = NetworkTask::new(
        config,
        backend,
        hardware.wifi,
        IdentityStore::new(storage.identity_path()),
        buffer,
        state,
        clock.clone(),
        NetworkChannels {
            events: event_rx,
            outcomes: outcome_tx,
            display: display_tx,
            scan_faults,
        },
        watchdog.register("network"),
    );

    let display = DisplayTask::new(
        hardware.display,
        display_rx,
        link.clone(),
        clock.clone(),
        config.display.tz(),
        std::time::Duration::from_millis(config.display.idle_after_ms),
        config.timing.lock_timeout(),
        watchdog.register("display"),
    );

    Ok(Tasks {
        scan,
        network,
        display,
        watchdog,
        link,
        clock,
    })
}

/// A running reader.
#[derive(Debug)]
pub struct ReaderHandle {
    link: LinkStateHandle,
    clock: SyncClock,
    shutdown: watch::Sender<bool>,
    threads: Vec<JoinHandle<()>>,
}

impl ReaderHandle {
    /// Current link state.
    #[must_use]
    pub fn link(&self) -> LinkSnapshot {
        self.link.snapshot()
    }

    /// The reader's wall clock.
    #[must_use]
    pub const fn clock(&self) -> &SyncClock {
        &self.clock
    }

    /// Ask every core to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for every core to stop.
    ///
    /// # Errors
    ///
    /// Returns the panic payload of the first core that panicked.
    pub fn join(self) -> thread::Result<()> {
        for thread in self.threads {
            thread.join()?;
        }
        Ok(())
    }
}

fn core_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

/// Start the scan core, the network core and the watchdog supervisor.
///
/// # Errors
///
/// Returns an error if a runtime or thread cannot be created.
pub fn spawn<R, F, D, B, W, H>(
    tasks: Tasks<R, F, D, B, W>,
    restart: H,
) -> std::io::Result<ReaderHandle>
where
    R: CardReader,
    F: Feedback,
    D: Display,
    B: Backend,
    W: WifiLink,
    H: RestartHandler,
{
    let (shutdown, shutdown_rx) = watch::channel(false);
    let Tasks {
        scan,
        network,
        display,
        watchdog,
        link,
        clock,
    } = tasks;

    let scan_runtime = core_runtime()?;
    let network_runtime = core_runtime()?;
    let supervisor_runtime = core_runtime()?;
    let mut threads = Vec::with_capacity(3);

    let mut stop = shutdown_rx.clone();
    threads.push(thread::Builder::new().name("tapin-scan".into()).spawn(move || {
        scan_runtime.block_on(async move {
            let scan = scan.run();
            let display = display.run();
            tokio::pin!(scan, display);
            tokio::select! {
                biased;
                _ = stop.changed() => {}
                () = &mut scan => error!("scan task returned"),
                () = &mut display => info!("display task finished"),
            }
        });
    })?);

    let mut stop = shutdown_rx.clone();
    threads.push(thread::Builder::new().name("tapin-network".into()).spawn(move || {
        network_runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = stop.changed() => {}
                () = network.run() => {}
            }
        });
    })?);

    let mut stop = shutdown_rx;
    threads.push(thread::Builder::new().name("tapin-watchdog".into()).spawn(move || {
        supervisor_runtime.block_on(async move {
            tokio::select! {
                _ = stop.changed() => {}
                report = watchdog.supervise(restart) => {
                    error!(task = report.task, "watchdog fired");
                }
            }
        });
    })?);

    info!("reader started");
    Ok(ReaderHandle {
        link,
        clock,
        shutdown,
        threads,
    })
}

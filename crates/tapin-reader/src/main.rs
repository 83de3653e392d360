//! # tapin-reader
//!
//! Runs a tapin reader on a workstation: badges are read from stdin, the
//! panel is the log, and events go to the configured backend.
//!
//! ## Running
//!
//! ```bash
//! TAPIN__DEVICE__PROVISIONING_SECRET=dev cargo run --package tapin-reader
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::{anyhow, Context};
use tapin_core::{assemble, spawn, Hardware, HttpBackend, ReaderConfig, Storage, SyncClock};
use tracing::{info, warn};

mod host;
mod logging;

fn main() -> anyhow::Result<()> {
    let config = ReaderConfig::load().context("failed to load reader configuration")?;

    let storage = match &config.storage.data_dir {
        Some(dir) => Storage::new(dir.clone()),
        None => Storage::platform_default()?,
    };

    logging::init(logging::is_production(), storage.data_dir())?;

    info!(
        device = %config.device.id,
        version = %config.device.firmware_version,
        backend = %config.backend.base_url,
        data_dir = %storage.data_dir().display(),
        "Starting tapin-reader"
    );

    let backend = HttpBackend::new(&config.backend.base_url, config.backend.request_timeout())?;
    let hardware = Hardware {
        reader: host::LineReader::stdin()?,
        feedback: host::LogFeedback,
        display: host::LogDisplay::default(),
        wifi: host::HostLink,
        clock: SyncClock::host(),
    };

    let tasks = assemble(&config, hardware, backend, &storage)?;
    let handle = spawn(tasks, host::ProcessRestart)?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
            }
        });

    info!(buffered = handle.link().buffered, "Shutting down");
    handle.shutdown();
    handle
        .join()
        .map_err(|_| anyhow!("a reader core panicked"))?;

    info!("tapin-reader stopped");
    Ok(())
}

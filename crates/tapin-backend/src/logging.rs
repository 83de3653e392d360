//! Logging initialization.
//!
//! Development logs go to stdout in the pretty format. Production adds JSON
//! files rotated daily under `TAPIN_BACKEND_LOG_DIR` (default
//! `/var/log/tapin`, or the platform data directory off Linux) and keeps a
//! compact, uncolored stdout for the service journal.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Flushes buffered file output when the process exits normally.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging.
///
/// `RUST_LOG` wins over `TAPIN_LOG_LEVEL`, which defaults to `info`.
///
/// # Errors
///
/// Returns an error if the env filter cannot be parsed.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let level = std::env::var("TAPIN_LOG_LEVEL").unwrap_or_else(|_| "info".into());
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&level))?;
    let registry = tracing_subscriber::registry().with(filter);

    if !is_production {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
        return Ok(());
    }

    let dir = log_directory();
    std::fs::create_dir_all(&dir).ok();
    let (file, guard) = tracing_appender::non_blocking(RollingFileAppender::new(
        Rotation::DAILY,
        &dir,
        "tapin-backend",
    ));

    registry
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file)
                .with_current_span(true),
        )
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(false))
        .init();

    let _ = FILE_GUARD.set(guard);
    Ok(())
}

fn log_directory() -> PathBuf {
    if let Some(dir) = std::env::var_os("TAPIN_BACKEND_LOG_DIR") {
        return PathBuf::from(dir);
    }
    if cfg!(target_os = "linux") {
        return PathBuf::from("/var/log/tapin");
    }
    directories::ProjectDirs::from("", "", "tapin")
        .map_or_else(|| PathBuf::from("logs"), |dirs| dirs.data_dir().join("logs"))
}

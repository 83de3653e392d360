//! Logging initialization.
//!
//! - **Production**: JSON logs to daily files under the data directory + compact stdout
//! - **Development**: Pretty logs to stdout

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Whether `TAPIN_PRODUCTION` selects production logging.
pub fn is_production() -> bool {
    std::env::var("TAPIN_PRODUCTION")
        .is_ok_and(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Initialize logging.
///
/// `RUST_LOG` wins over `TAPIN_LOG_LEVEL`, which defaults to `info`.
/// In production, files rotate daily under `<data_dir>/logs`.
///
/// # Errors
///
/// Returns an error if the env filter cannot be parsed.
pub fn init(is_production: bool, data_dir: &Path) -> anyhow::Result<()> {
    let log_level = std::env::var("TAPIN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    if !is_production {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_names(true),
            )
            .init();
        return Ok(());
    }

    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "tapin-reader");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking_file)
                .with_thread_names(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(false)
                .with_thread_names(true),
        )
        .init();

    let _ = FILE_GUARD.set(guard);
    Ok(())
}

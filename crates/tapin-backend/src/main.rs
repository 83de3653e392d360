//! # tapin-backend
//!
//! Reference attendance backend for tapin readers.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! TAPIN_BACKEND_SECRET=dev cargo run --package tapin-backend
//!
//! # Production
//! TAPIN_PRODUCTION=1 TAPIN_BACKEND_SECRET=... ./tapin-backend
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use tapin_backend::api::create_router;
use tapin_backend::config::Config;
use tapin_backend::logging;
use tapin_backend::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load backend configuration")?;

    logging::init(config.production)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        roster = config.roster.len(),
        "Starting tapin-backend"
    );

    let app = create_router(AppState::new(&config));

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    info!("Listening on {}", config.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("tapin-backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

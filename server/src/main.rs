//! Askbox Server - Main entry point.
//!
//! This binary starts the Askbox server with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Background rate limiter cleanup
//! - Configuration hot reload
//!
//! # Configuration
//!
//! See [`askbox_server::config`] for the configuration file format.
//!
//! # Example
//!
//! ```bash
//! ASKBOX_CONFIG=/etc/askbox/config.toml \
//! ASKBOX_ADMIN_PASSWORD="change-me" \
//! PORT=8080 \
//! cargo run --release --bin askbox-server
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use askbox_server::config::{config_path, Config};
use askbox_server::reload::ConfigWatcher;
use askbox_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let path = config_path();
    let config = match Config::load_from(&path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, path = %path.display(), "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Configuration file: {}", path.display());
            eprintln!("  [admin] password is required");
            eprintln!();
            eprintln!("Environment variables:");
            eprintln!("  ASKBOX_CONFIG          - Configuration file path (default: config.toml)");
            eprintln!("  ASKBOX_ADMIN_PASSWORD  - Overrides [admin] password");
            eprintln!("  PORT                   - Overrides [server] port");
            eprintln!("  RUST_LOG               - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        address = %config.bind_address(),
        questions_per_hour = config.limits.questions_per_hour,
        questions_burst = config.limits.questions_burst,
        max_viewers = config.hub.max_viewers,
        "Askbox server starting"
    );

    let state = match AppState::new(&config) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Failed to initialize authentication");
            return ExitCode::from(1);
        }
    };

    let cleanup_interval = config.limits.cleanup_interval();
    let cleanup_handle = state.rate_limiter.spawn_cleanup_task(cleanup_interval);
    info!(
        interval_secs = cleanup_interval.as_secs(),
        "Rate limiter cleanup task started"
    );

    // Reload is best effort; the server runs fine on the startup config.
    let watcher = match ConfigWatcher::spawn(path, Arc::clone(&state.auth), Arc::clone(&state.ui)) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Configuration hot reload disabled");
            None
        }
    };

    let app = create_router(state);

    let bind_addr = config.bind_address();
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");

    cleanup_handle.abort();
    drop(watcher);
    info!("Background tasks stopped");

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM or SIGINT (Ctrl+C) is received.
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

//! Gatehouse Server - Main entry point.
//!
//! This binary starts the gateway with:
//! - `.env` loading from the working directory or its ancestors
//! - Structured JSON logging
//! - The `GET /health` route
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`gatehouse_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! GATEHOUSE_ORIGIN="https://app.example.com" \
//! GATEHOUSE_TOKEN_SECRET="change-me" \
//! PORT=8080 \
//! cargo run --release --bin gatehouse-server
//! ```

use std::process::ExitCode;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use gatehouse_server::config::{load_env_file, Config};
use gatehouse_server::gateway::{Gateway, REALTIME_PATH};
use gatehouse_server::registry::RouteRegistry;
use gatehouse_server::routes::{create_router, health_route, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    let env_file = load_env_file();
    let config = Config::from_env();

    init_logging(config.as_ref().is_ok_and(|c| c.debug));

    if let Some(path) = env_file {
        info!(path = %path.display(), "Environment loaded from file");
    }

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  GATEHOUSE_ORIGIN               - Allowed origin for CORS and realtime");
            eprintln!("  GATEHOUSE_TOKEN_SECRET         - HMAC secret for session tokens");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  GATEHOUSE_COOKIE_NAME          - Session cookie name (default: session)");
            eprintln!("  GATEHOUSE_DEBUG                - Debug logging (default: false)");
            eprintln!("  GATEHOUSE_BODY_TIMEOUT_SECS    - Request body timeout (default: 10)");
            eprintln!("  GATEHOUSE_HANDLER_TIMEOUT_SECS - Route handler timeout (default: 30)");
            eprintln!("  PORT                           - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                       - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Server failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        port = config.port,
        origin = %config.origin,
        cookie_name = %config.cookie_name,
        debug = config.debug,
        "Gatehouse server starting"
    );

    let gateway = Gateway::new([config.origin.clone()]);
    let state = {
        let mut registry = RouteRegistry::new();
        registry
            .register([health_route(gateway.clone(), tokio::time::Instant::now())])
            .context("failed to register built-in routes")?;
        AppState::new(config.clone(), registry, gateway).context("invalid configuration")?
    };
    info!(routes = state.dispatcher.registry().len(), "Routes applied");

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(
        port = config.port,
        address = %bind_addr,
        realtime_path = REALTIME_PATH,
        "Server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server shutting down gracefully");
    Ok(())
}

/// Initialize structured logging with tracing.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `info`, raised to
/// `debug` for this crate when the debug toggle is on.
fn init_logging(debug: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("info,gatehouse_server=debug,tower_http=debug")
        } else {
            EnvFilter::new("info")
        }
    });

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

/// Resolves when SIGINT or SIGTERM is received.
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

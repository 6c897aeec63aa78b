//! Stitch Server
//!
//! Resumable chunked upload server: hash check, chunk upload and merge over
//! HTTP, with a websocket push binding for progress and merge outcomes.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stitch_server::config::Config;
use stitch_server::routes;
use stitch_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "stitch_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Stitch Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage backend: {:?}", config.storage.backend);
    tracing::info!("Chunk directory: {}", config.storage.chunk_dir.display());
    tracing::info!("Output directory: {}", config.storage.output_dir.display());

    tokio::fs::create_dir_all(&config.storage.output_dir)
        .await
        .with_context(|| format!("creating {}", config.storage.output_dir.display()))?;

    // Create application state
    let app_state = AppState::new(config.clone());

    // Reclaim chunks of abandoned uploads
    let reaper = if config.retention.chunk_ttl_secs > 0 {
        Some(app_state.chunk_reaper().start_task())
    } else {
        tracing::info!("CHUNK_TTL_SECS is 0, chunk reaper disabled");
        None
    };

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid SERVER_HOST {:?}", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Stitch Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

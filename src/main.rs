mod archive;
mod catalog;
mod config;
mod error;
mod health;
mod http;
mod media;
mod metrics;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::archive::Coordinator;
use crate::archive::disk::{SpaceProbe, StagingDir, StatvfsProbe};
use crate::catalog::Catalog;
use crate::catalog::json_file::JsonFileCatalog;
use crate::config::Config;
use crate::media::FsMediaStore;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "album-archiver", about = "On-demand photo album archives")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/album-archiver/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub coordinator: Arc<Coordinator>,
    pub catalog: Arc<dyn Catalog>,
    /// Free-space probe for the staging filesystem.
    pub space: Arc<dyn SpaceProbe>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);
    tracing::info!(config_path = %cli.config, "starting album-archiver");

    // ---- Staging directory ----
    let staging = StagingDir::prepare(&config.archives.staging_dir)
        .await
        .context("failed to prepare staging directory")?;

    // ---- Collaborators ----
    let catalog: Arc<dyn Catalog> = Arc::new(JsonFileCatalog::new(&config.catalog.path));
    let media = Arc::new(FsMediaStore::new(&config.media.root));
    let space: Arc<dyn SpaceProbe> = Arc::new(StatvfsProbe);
    tracing::info!(
        catalog = %config.catalog.path.display(),
        media_root = %config.media.root.display(),
        "collaborators initialised"
    );

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Coordinator ----
    let coordinator = Coordinator::new(
        config.archives.clone(),
        Arc::clone(&catalog),
        media,
        staging,
        Arc::clone(&space),
        metrics.clone(),
    );

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        coordinator: Arc::clone(&coordinator),
        catalog,
        space,
        metrics,
    };

    // ---- Shutdown wiring ----
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // ---- Spawn services ----
    let http_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = run_http_server(state, shutdown.clone()).await {
                tracing::error!(error = %format!("{e:#}"), "HTTP server failed");
                shutdown.cancel();
            }
        }
    });

    let sweeper_handle = tokio::spawn(archive::sweeper::run_sweeper(
        Arc::clone(&coordinator),
        shutdown.clone(),
    ));

    // ---- Await shutdown ----
    let _ = tokio::try_join!(http_handle, sweeper_handle);

    tracing::info!("album-archiver shut down cleanly");
    Ok(())
}

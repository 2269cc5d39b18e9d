//! wafer-sim - Wafer inspection simulation service
//!
//! Runs simulated inspection machines in the background and serves run
//! control, result analytics and live events over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wafer_common::config::{resolve_root_folder, OutputDirs, TomlConfig, ROOT_FOLDER_ENV};
use wafer_common::events::EventBus;

use wafer_sim::image_source::{ImagePool, ImageSource};
use wafer_sim::scorer::build_scorer;
use wafer_sim::{AppState, RunParameters};

/// Event bus capacity per subscriber
const EVENT_BUS_CAPACITY: usize = 256;

/// Command-line arguments for wafer-sim
#[derive(Parser, Debug)]
#[command(name = "wafer-sim")]
#[command(about = "Wafer inspection simulation service")]
#[command(version)]
struct Args {
    /// Root folder for run output
    #[arg(short, long, env = "WAFER_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Configuration file (default: <config dir>/wafer/wafer-sim.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides [server] port)
    #[arg(short, long, env = "WAFER_SIM_PORT")]
    port: Option<u16>,

    /// Sample image dataset (overrides dataset_dir)
    #[arg(short, long, env = "WAFER_DATASET_DIR")]
    dataset: Option<PathBuf>,

    /// Start a run with the configured defaults immediately
    #[arg(long)]
    run_now: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };
    let default_filter = format!(
        "wafer_sim={0},wafer_common={0},tower_http=info",
        config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        built = env!("BUILD_TIMESTAMP"),
        profile = env!("BUILD_PROFILE"),
        "Starting wafer-sim"
    );

    let root_folder = resolve_root_folder(
        args.root_folder.as_deref(),
        ROOT_FOLDER_ENV,
        config.root_folder.as_deref(),
    );
    let output = OutputDirs::under(&root_folder);
    output
        .ensure()
        .with_context(|| format!("Failed to create output folders under {}", root_folder.display()))?;
    info!(root_folder = %root_folder.display(), results_dir = %output.results_dir.display(), "Output folders ready");

    let pool = match args.dataset.as_ref().or(config.dataset_dir.as_ref()) {
        Some(dataset) => match ImagePool::scan(dataset) {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "Image dataset unavailable, machines will produce no wafers");
                ImagePool::default()
            }
        },
        None => {
            warn!("No dataset configured (--dataset or dataset_dir), machines will produce no wafers");
            ImagePool::default()
        }
    };
    let scorer = build_scorer(&pool);
    let image_source: Arc<dyn ImageSource> = Arc::new(pool);

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let host = config.server.host.clone();
    let port = args.port.unwrap_or(config.server.port);
    let state = AppState::new(config, output, image_source, scorer, event_bus);

    if args.run_now {
        let params = RunParameters::from_settings(&state.config.simulation);
        let controller = wafer_sim::api::launch_run(&state, params)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start simulation: {}", e))?;
        info!(run_id = %controller.run_id(), "Simulation started from command line");
    }

    let app = wafer_sim::build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(controller) = state.controller.read().await.clone() {
        controller.stop_all_machines();
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

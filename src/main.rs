//! flexllama - OpenAI-compatible gateway for a fleet of llama.cpp runners.
//!
//! Loads the config, binds the API (and optional metrics) listener, then
//! serves until SIGINT/SIGTERM, at which point every runner is drained and
//! its child process stopped.

use anyhow::{Context, Result};
use clap::Parser;
use flexllama::Config;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Per-runner drain budget during shutdown before escalating to kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "flexllama")]
#[command(about = "OpenAI-compatible gateway for a fleet of llama.cpp runners")]
struct Args {
    /// Path to configuration file
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Child process output is logged under the "llama" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,llama=debug.
    let filter = if args.verbose {
        EnvFilter::new("flexllama=debug,tower_http=debug,llama=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting FlexLLama");

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.api.port = port;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        models = ?config.aliases(),
        runners = config.runners.len(),
        port = config.api.port,
        "Configuration loaded"
    );

    let metrics_port = config.metrics_port;
    let api_host = config.api.host.clone();
    let api_port = config.api.port;
    let auto_start = config.auto_start_runners;

    let (app, metrics_router, supervisor) = flexllama::build_app(config)
        .await
        .context("Failed to build application")?;

    if metrics_port > 0
        && let Some(metrics_router) = metrics_router
    {
        let metrics_addr = format!("{api_host}:{metrics_port}");
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {metrics_addr}"))?;
        info!(addr = %metrics_addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let addr = format!("{api_host}:{api_port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(addr = %addr, "Listening for requests");

    if auto_start {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor.autostart_defaults().await;
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    supervisor.shutdown(SHUTDOWN_GRACE).await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

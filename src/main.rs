use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reddit_media_dl::config::Config;
use reddit_media_dl::orchestrator::Orchestrator;
use reddit_media_dl::task::load_task_file;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting reddit-media-dl");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(output_dir = %config.output_dir.display(), "Configuration loaded");

    let tasks = match &config.tasks_file {
        Some(path) => {
            let tasks = load_task_file(path).await?;
            info!(path = %path.display(), count = tasks.len(), "Tasks loaded");
            tasks
        }
        None if config.retry_failed => Vec::new(),
        None => {
            warn!("No TASKS_FILE set and RETRY_FAILED is off, nothing to do");
            return Ok(());
        }
    };

    let cancel = CancellationToken::new();
    let orchestrator = Arc::new(
        Orchestrator::open(config, cancel.clone())
            .await
            .context("Failed to initialize downloader")?,
    );

    let signal_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("Interrupt received, finishing in-flight work");
            cancel.cancel();
        })
    };

    let result = orchestrator.run(tasks).await;
    signal_handle.abort();

    // Flush the index even if the run failed part way.
    if let Err(e) = orchestrator.shutdown().await {
        error!("Failed to close index cleanly: {e:#}");
    }

    let summary = result?;
    summary.log();
    info!("{summary}");

    if summary.pending_failures > 0 {
        info!(
            pending = summary.pending_failures,
            "Failed tasks recorded; rerun with RETRY_FAILED=true to retry them"
        );
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reddit_media_dl=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
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
                error!("Failed to install SIGTERM handler: {e}");
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
}

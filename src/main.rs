use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cafe_archiver::config::{Config, WorkerMode};
use cafe_archiver::db::Database;
use cafe_archiver::dispatcher::{InProcessExecutor, JobExecutor, QueueDispatcher, SubprocessExecutor};
use cafe_archiver::logging::init_tracing;
use cafe_archiver::runner::JobRunner;
use cafe_archiver::sink::notifier_from_config;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting cafe-archiver dispatcher");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        database = %config.database_path.display(),
        worker_mode = ?config.worker_mode,
        "Configuration loaded"
    );

    match config.session_state_path.as_deref() {
        Some(path) if path.exists() => info!(path = %path.display(), "Session file found"),
        Some(path) => warn!(path = %path.display(), "Session file configured but not found; the stored session will be used"),
        None if config.session_encryption_key.is_none() => {
            warn!("Neither SESSION_STATE_PATH nor SESSION_ENCRYPTION_KEY is set; scrape jobs will fail");
        }
        None => {}
    }

    tokio::fs::create_dir_all(config.results_dir())
        .await
        .with_context(|| format!("Failed to create results directory: {}", config.results_dir().display()))?;

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    info!("Database initialized");

    let executor: Arc<dyn JobExecutor> = match config.worker_mode {
        WorkerMode::Inline => Arc::new(InProcessExecutor::new(JobRunner::from_config(
            config.clone(),
            db.clone(),
        )?)),
        WorkerMode::Subprocess => Arc::new(SubprocessExecutor::new(
            config.worker_binary_path.clone(),
            db.pool().clone(),
        )),
    };
    let notifier = notifier_from_config(&config);
    let dispatcher = QueueDispatcher::new(config, db, executor, notifier);

    let shutdown = CancellationToken::new();
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    shutdown_signal().await;

    info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = dispatcher_handle.await {
        error!("Dispatcher task ended abnormally: {e}");
    }

    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
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

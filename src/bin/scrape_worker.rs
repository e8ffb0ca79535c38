//! Out-of-process worker: runs exactly one job and exits.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use cafe_archiver::config::Config;
use cafe_archiver::db::{finish_job, Database, JobStatus};
use cafe_archiver::logging::init_tracing;
use cafe_archiver::runner::JobRunner;

#[derive(Parser, Debug)]
#[command(name = "scrape-worker", version, about = "Run one cafe scrape job to completion")]
struct Cli {
    /// ID of the job to execute
    job_id: i64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli.job_id).await {
        Ok(JobStatus::Success | JobStatus::Cancelled) => {}
        Ok(status) => {
            error!(job_id = cli.job_id, status = status.as_str(), "Job did not succeed");
            std::process::exit(1);
        }
        Err(e) => {
            error!(job_id = cli.job_id, "Worker failed: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(job_id: i64) -> Result<JobStatus> {
    let _ = dotenvy::dotenv();

    init_tracing()?;

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    info!(job_id, pid = std::process::id(), "Worker starting");
    let runner = JobRunner::from_config(config, db.clone())?;
    match runner.execute(job_id).await {
        Ok(outcome) => Ok(outcome.status),
        Err(e) => {
            // Leave no RUNNING job behind for the stale sweep to find.
            let message = format!("Worker error: {e:#}");
            match finish_job(db.pool(), job_id, JobStatus::Failed, Some(&message)).await {
                Ok(true) => warn!(job_id, "Marked job failed after worker error"),
                Ok(false) => {}
                Err(finish_err) => error!(job_id, "Failed to mark job failed: {finish_err:#}"),
            }
            Err(e)
        }
    }
}

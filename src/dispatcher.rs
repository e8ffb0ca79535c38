//! Single-flight job queue dispatcher.
//!
//! Each tick writes a rate-limited heartbeat, fails stale RUNNING jobs,
//! and then, only when nothing is RUNNING, runs at most one job: a due
//! REFRESH_CAFES maintenance job or the oldest QUEUED job. All coordination
//! state lives in the store, so a restarted dispatcher picks up where the
//! last one stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::constants::cancel_key;
use crate::db::{
    count_recent_jobs_of_type, count_running_jobs, create_job, delete_settings, fail_stale_jobs,
    finish_job, get_job, list_jobs_by_status, mark_job_running, Database, JobStatus, JobType,
    NewScrapeJob, ScrapeJob,
};
use crate::progress::write_heartbeat;
use crate::runner::JobRunner;
use crate::sink::Notifier;

/// Runs one job that the dispatcher has already moved to RUNNING.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job_id: i64) -> Result<()>;
}

/// Runs jobs inside the dispatcher process.
pub struct InProcessExecutor {
    runner: JobRunner,
}

impl InProcessExecutor {
    #[must_use]
    pub fn new(runner: JobRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl JobExecutor for InProcessExecutor {
    async fn execute(&self, job_id: i64) -> Result<()> {
        self.runner.execute(job_id).await.map(|_| ())
    }
}

/// Runs each job in a `scrape-worker` child process and waits for it.
pub struct SubprocessExecutor {
    binary: PathBuf,
    pool: SqlitePool,
}

impl SubprocessExecutor {
    #[must_use]
    pub fn new(binary: PathBuf, pool: SqlitePool) -> Self {
        Self { binary, pool }
    }
}

#[async_trait]
impl JobExecutor for SubprocessExecutor {
    async fn execute(&self, job_id: i64) -> Result<()> {
        debug!(job_id, binary = %self.binary.display(), "Spawning worker");
        let status = tokio::process::Command::new(&self.binary)
            .arg(job_id.to_string())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        // The worker records its own terminal status; a crash leaves it RUNNING.
        let still_running = get_job(&self.pool, job_id)
            .await?
            .is_some_and(|job| job.status_enum() == Some(JobStatus::Running));
        if still_running {
            let message = format!("Worker exited with {status} before recording a result");
            finish_job(&self.pool, job_id, JobStatus::Failed, Some(&message)).await?;
            warn!(job_id, %status, "Worker exited without finishing the job");
        } else if !status.success() {
            debug!(job_id, %status, "Worker exited non-zero after recording its result");
        }
        Ok(())
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Another job is RUNNING; nothing started.
    Busy,
    /// Nothing to do.
    Idle,
    /// A job ran to completion.
    Executed {
        job_id: i64,
        job_type: JobType,
        status: Option<JobStatus>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub stale_failed: Vec<i64>,
    pub action: TickAction,
}

/// The outer dispatcher loop.
pub struct QueueDispatcher {
    config: Config,
    db: Database,
    executor: Arc<dyn JobExecutor>,
    notifier: Arc<dyn Notifier>,
    last_heartbeat: Option<Instant>,
}

impl QueueDispatcher {
    #[must_use]
    pub fn new(
        config: Config,
        db: Database,
        executor: Arc<dyn JobExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            db,
            executor,
            notifier,
            last_heartbeat: None,
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    /// Run ticks on a fixed interval until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            stale_after_secs = self.config.stale_job_after.as_secs(),
            "Dispatcher started"
        );

        loop {
            match self.tick().await {
                Ok(report) => trace!(?report, "Tick complete"),
                Err(e) => error!("Dispatcher tick failed: {e:#}"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = shutdown.cancelled() => {
                    info!("Dispatcher shutting down");
                    break;
                }
            }
        }
    }

    /// One dispatcher step.
    pub async fn tick(&mut self) -> Result<TickReport> {
        self.heartbeat("polling").await;

        let stale_failed = self.recover_stale().await?;

        let running = count_running_jobs(self.pool()).await?;
        if running > 0 {
            trace!(running, "A job is already running");
            return Ok(TickReport {
                stale_failed,
                action: TickAction::Busy,
            });
        }

        if let Some(job_id) = self.due_refresh_job().await? {
            let action = self.run_job(job_id).await?;
            return Ok(TickReport {
                stale_failed,
                action,
            });
        }

        let action = match list_jobs_by_status(self.pool(), JobStatus::Queued, 1)
            .await?
            .into_iter()
            .next()
        {
            Some(job) => self.run_job(job.id).await?,
            None => TickAction::Idle,
        };

        Ok(TickReport {
            stale_failed,
            action,
        })
    }

    async fn heartbeat(&mut self, activity: &str) {
        let due = self
            .last_heartbeat
            .map_or(true, |at| at.elapsed() >= self.config.heartbeat_interval);
        if !due {
            return;
        }
        match write_heartbeat(self.pool(), activity).await {
            Ok(()) => self.last_heartbeat = Some(Instant::now()),
            Err(e) => warn!("Failed to write heartbeat: {e:#}"),
        }
    }

    async fn recover_stale(&self) -> Result<Vec<i64>> {
        let message = format!(
            "Stale: no progress for more than {}s, presumed crashed",
            self.config.stale_job_after.as_secs()
        );
        let failed = fail_stale_jobs(self.pool(), self.config.stale_job_after, &message).await?;
        for job_id in &failed {
            warn!(job_id, "Failed stale job");
            delete_settings(self.pool(), &[cancel_key(*job_id)]).await?;
            self.notify_finished(*job_id).await;
        }
        Ok(failed)
    }

    /// Create a REFRESH_CAFES job when none ran within the refresh interval.
    async fn due_refresh_job(&self) -> Result<Option<i64>> {
        let Some(interval) = self.config.cafe_refresh_interval else {
            return Ok(None);
        };
        if count_recent_jobs_of_type(self.pool(), JobType::RefreshCafes, interval).await? > 0 {
            return Ok(None);
        }
        let job_id = create_job(self.pool(), &NewScrapeJob::default(), JobType::RefreshCafes).await?;
        info!(job_id, "Queued joined-cafe refresh");
        Ok(Some(job_id))
    }

    async fn run_job(&mut self, job_id: i64) -> Result<TickAction> {
        if !mark_job_running(self.pool(), job_id).await? {
            debug!(job_id, "Job left QUEUED before it could start");
            return Ok(TickAction::Idle);
        }
        self.last_heartbeat = None;
        self.heartbeat(&format!("running job {job_id}")).await;

        if let Err(e) = self.executor.execute(job_id).await {
            error!(job_id, "Job execution failed: {e:#}");
            let message = format!("{e:#}");
            if let Err(e) = finish_job(self.pool(), job_id, JobStatus::Failed, Some(&message)).await {
                error!(job_id, "Failed to mark job failed: {e:#}");
            }
        }

        let job = get_job(self.pool(), job_id).await?;
        self.notify_finished(job_id).await;
        self.last_heartbeat = None;
        self.heartbeat("polling").await;

        Ok(TickAction::Executed {
            job_id,
            job_type: job
                .as_ref()
                .and_then(ScrapeJob::job_type_enum)
                .unwrap_or(JobType::Scrape),
            status: job.as_ref().and_then(ScrapeJob::status_enum),
        })
    }

    async fn notify_finished(&self, job_id: i64) {
        match get_job(self.pool(), job_id).await {
            Ok(Some(job)) => self.notifier.notify(job_id, &summary(&job)).await,
            Ok(None) => {}
            Err(e) => warn!(job_id, "Failed to load job for notification: {e:#}"),
        }
    }
}

/// One-line human summary of a finished job.
#[must_use]
pub fn summary(job: &ScrapeJob) -> String {
    let mut text = format!(
        "[{}] job #{} {}: {} posts, {} sent to sheet",
        job.job_type, job.id, job.status, job.result_count, job.sheet_synced
    );
    if let Some(message) = job.error_message.as_deref().filter(|m| !m.is_empty()) {
        text.push_str(" - ");
        text.push_str(message);
    }
    text
}

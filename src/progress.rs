//! Job progress snapshots, cooperative cancel flags and the dispatcher heartbeat.
//!
//! All three live in the settings store under per-job keys so that any
//! process (the dispatcher, an out-of-process worker, an operator tool) can
//! read or set them. Writes are idempotent upserts.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::constants::{cancel_key, progress_key, HEARTBEAT_SETTING_KEY};
use crate::db::{cancel_queued_job, delete_settings, get_job, get_setting, touch_job, upsert_setting, JobStatus};
use crate::error::{JobError, JobResult};

/// Coarse phase of a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Search,
    Parse,
    Done,
    Cancelled,
    Failed,
}

/// Status of one (cafe, keyword) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Searching,
    Parsing,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairProgress {
    pub cafe_id: String,
    pub keyword: String,
    pub status: PairStatus,
    pub pages_scanned: usize,
    pub pages_target: usize,
    pub candidates: usize,
    pub collected: usize,
    pub skipped: usize,
    pub filtered: usize,
}

/// Current snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: i64,
    pub updated_at: String,
    pub stage: Stage,
    pub cafe_id: Option<String>,
    pub cafe_name: Option<String>,
    pub cafe_index: usize,
    pub cafe_total: usize,
    pub keyword: Option<String>,
    pub keyword_index: usize,
    pub keyword_total: usize,
    pub url: Option<String>,
    pub url_index: usize,
    pub url_total: usize,
    pub candidates: usize,
    pub parse_attempts: usize,
    pub collected: usize,
    pub db_synced: usize,
    pub sheet_synced: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pairs: Vec<PairProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobProgress {
    #[must_use]
    pub fn new(job_id: i64) -> Self {
        Self {
            job_id,
            updated_at: Utc::now().to_rfc3339(),
            stage: Stage::Search,
            cafe_id: None,
            cafe_name: None,
            cafe_index: 0,
            cafe_total: 0,
            keyword: None,
            keyword_index: 0,
            keyword_total: 0,
            url: None,
            url_index: 0,
            url_total: 0,
            candidates: 0,
            parse_attempts: 0,
            collected: 0,
            db_synced: 0,
            sheet_synced: 0,
            pairs: Vec::new(),
            message: None,
        }
    }
}

/// Progress and cancellation channel for one running job.
pub struct ProgressChannel {
    pool: SqlitePool,
    job_id: i64,
    snapshot: JobProgress,
}

impl ProgressChannel {
    /// Attach to a job that is already RUNNING.
    ///
    /// Leftover keys were cleared when the job left QUEUED; a cancel flag
    /// present now was set for this run and is honoured at the first checkpoint.
    #[must_use]
    pub fn start(pool: SqlitePool, job_id: i64) -> Self {
        debug!(job_id, "Progress channel attached");
        Self {
            pool,
            job_id,
            snapshot: JobProgress::new(job_id),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> &JobProgress {
        &self.snapshot
    }

    /// Mutate the snapshot without publishing.
    pub fn update(&mut self, f: impl FnOnce(&mut JobProgress)) {
        f(&mut self.snapshot);
    }

    /// The pair entry for (cafe, keyword), created on first use.
    pub fn pair_mut(&mut self, cafe_id: &str, keyword: &str) -> &mut PairProgress {
        let index = self
            .snapshot
            .pairs
            .iter()
            .position(|p| p.cafe_id == cafe_id && p.keyword == keyword)
            .unwrap_or_else(|| {
                self.snapshot.pairs.push(PairProgress {
                    cafe_id: cafe_id.to_string(),
                    keyword: keyword.to_string(),
                    status: PairStatus::Searching,
                    pages_scanned: 0,
                    pages_target: 0,
                    candidates: 0,
                    collected: 0,
                    skipped: 0,
                    filtered: 0,
                });
                self.snapshot.pairs.len() - 1
            });
        &mut self.snapshot.pairs[index]
    }

    /// Overwrite the stored snapshot and mark the job alive.
    pub async fn publish(&mut self) -> Result<()> {
        self.snapshot.updated_at = Utc::now().to_rfc3339();
        let json = serde_json::to_string(&self.snapshot).context("Failed to encode progress")?;
        upsert_setting(&self.pool, &progress_key(self.job_id), &json).await?;
        touch_job(&self.pool, self.job_id).await?;
        Ok(())
    }

    /// Checkpoint: fail with [`JobError::Cancelled`] when the cancel flag is set.
    pub async fn check_cancelled(&self) -> JobResult<()> {
        if is_cancel_requested(&self.pool, self.job_id).await? {
            info!(job_id = self.job_id, "Cancel flag observed");
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// Record the terminal stage.
    ///
    /// A clean finish removes the snapshot; cancelled and failed runs keep it
    /// with the terminal stage for inspection. The cancel flag is always cleared.
    pub async fn finish(&mut self, stage: Stage, message: Option<String>) -> Result<()> {
        self.snapshot.stage = stage;
        self.snapshot.message = message;
        if stage == Stage::Done {
            delete_settings(&self.pool, &[progress_key(self.job_id)]).await?;
        } else {
            self.publish().await?;
        }
        delete_settings(&self.pool, &[cancel_key(self.job_id)]).await?;
        Ok(())
    }
}

/// Whether the cancel flag for a job is set.
pub async fn is_cancel_requested(pool: &SqlitePool, job_id: i64) -> Result<bool> {
    Ok(get_setting(pool, &cancel_key(job_id))
        .await?
        .is_some_and(|v| matches!(v.trim(), "1" | "true")))
}

/// Read a job's current progress snapshot.
pub async fn read_progress(pool: &SqlitePool, job_id: i64) -> Result<Option<JobProgress>> {
    get_setting(pool, &progress_key(job_id))
        .await?
        .map(|raw| serde_json::from_str(&raw).context("Failed to decode progress"))
        .transpose()
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started and is now CANCELLED.
    CancelledQueued,
    /// The job is running; it stops at its next checkpoint.
    FlagSet,
    AlreadyFinished,
    NotFound,
}

/// Request cancellation of a job.
pub async fn request_cancel(pool: &SqlitePool, job_id: i64) -> Result<CancelOutcome> {
    let Some(job) = get_job(pool, job_id).await? else {
        return Ok(CancelOutcome::NotFound);
    };

    match job.status_enum() {
        Some(JobStatus::Queued) => {
            if cancel_queued_job(pool, job_id, "Cancelled before start").await? {
                delete_settings(pool, &[cancel_key(job_id), progress_key(job_id)]).await?;
                info!(job_id, "Cancelled queued job");
                return Ok(CancelOutcome::CancelledQueued);
            }
            // Picked up between the read and the update: cancel the run instead.
            upsert_setting(pool, &cancel_key(job_id), "1").await?;
            Ok(CancelOutcome::FlagSet)
        }
        Some(JobStatus::Running) => {
            upsert_setting(pool, &cancel_key(job_id), "1").await?;
            info!(job_id, "Cancel flag set for running job");
            Ok(CancelOutcome::FlagSet)
        }
        _ => Ok(CancelOutcome::AlreadyFinished),
    }
}

/// Dispatcher liveness record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub pid: u32,
    pub host: String,
    pub activity: String,
    pub at: String,
}

/// Write the dispatcher heartbeat.
pub async fn write_heartbeat(pool: &SqlitePool, activity: &str) -> Result<()> {
    let heartbeat = Heartbeat {
        pid: std::process::id(),
        host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        activity: activity.to_string(),
        at: Utc::now().to_rfc3339(),
    };
    let json = serde_json::to_string(&heartbeat).context("Failed to encode heartbeat")?;
    upsert_setting(pool, HEARTBEAT_SETTING_KEY, &json).await
}

/// Read the last dispatcher heartbeat.
pub async fn read_heartbeat(pool: &SqlitePool) -> Result<Option<Heartbeat>> {
    get_setting(pool, HEARTBEAT_SETTING_KEY)
        .await?
        .map(|raw| serde_json::from_str(&raw).context("Failed to decode heartbeat"))
        .transpose()
}

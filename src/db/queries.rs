use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::constants::{cancel_key, progress_key};

use super::models::{
    clamp_max_posts, JobStatus, JobType, NewScrapeJob, ParsedPost, ScrapeJob, Setting, StoredPost,
};

fn seconds_ago_modifier(window: Duration) -> String {
    format!("-{} seconds", window.as_secs())
}

fn to_json_list(values: &[String]) -> Result<String> {
    serde_json::to_string(values).context("Failed to encode list column")
}

// ========== Jobs ==========

/// Insert a new job in QUEUED state, returning its ID.
///
/// A scrape job needs direct URLs, or keywords together with at least one
/// cafe. `max_posts` is clamped into the supported range; a value of zero
/// (unset) becomes the lower bound.
pub async fn create_job(pool: &SqlitePool, job: &NewScrapeJob, job_type: JobType) -> Result<i64> {
    if job_type == JobType::Scrape {
        let has_urls = job.direct_urls.iter().any(|u| !u.trim().is_empty());
        let has_keywords = job.keywords.iter().any(|k| !k.trim().is_empty());
        let has_cafes = job.cafe_ids.iter().any(|c| !c.trim().is_empty());
        anyhow::ensure!(
            has_urls || (has_keywords && has_cafes),
            "a scrape job needs direct URLs, or keywords and at least one cafe"
        );
    }

    let result = sqlx::query(
        r"
        INSERT INTO scrape_jobs (
            job_type, status, keywords, direct_urls, include_words, exclude_words,
            exclude_boards, from_date, to_date, min_view_count, min_comment_count,
            use_auto_filter, max_posts, cafe_ids, cafe_names
        )
        VALUES (?, 'QUEUED', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(job_type.as_str())
    .bind(to_json_list(&job.keywords)?)
    .bind(to_json_list(&job.direct_urls)?)
    .bind(to_json_list(&job.include_words)?)
    .bind(to_json_list(&job.exclude_words)?)
    .bind(to_json_list(&job.exclude_boards)?)
    .bind(&job.from_date)
    .bind(&job.to_date)
    .bind(job.min_view_count)
    .bind(job.min_comment_count)
    .bind(job.use_auto_filter)
    .bind(clamp_max_posts(job.max_posts))
    .bind(to_json_list(&job.cafe_ids)?)
    .bind(to_json_list(&job.cafe_names)?)
    .execute(pool)
    .await
    .context("Failed to insert scrape job")?;

    Ok(result.last_insert_rowid())
}

/// Get a job by ID.
pub async fn get_job(pool: &SqlitePool, id: i64) -> Result<Option<ScrapeJob>> {
    sqlx::query_as("SELECT * FROM scrape_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch scrape job")
}

/// List jobs in a status, oldest first.
pub async fn list_jobs_by_status(
    pool: &SqlitePool,
    status: JobStatus,
    limit: i64,
) -> Result<Vec<ScrapeJob>> {
    sqlx::query_as(
        r"
        SELECT * FROM scrape_jobs
        WHERE status = ?
        ORDER BY created_at ASC, id ASC
        LIMIT ?
        ",
    )
    .bind(status.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list scrape jobs by status")
}

/// List the most recently created jobs, newest first.
pub async fn list_recent_jobs(pool: &SqlitePool, limit: i64) -> Result<Vec<ScrapeJob>> {
    sqlx::query_as("SELECT * FROM scrape_jobs ORDER BY created_at DESC, id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list recent scrape jobs")
}

/// Count jobs currently RUNNING.
pub async fn count_running_jobs(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scrape_jobs WHERE status = 'RUNNING'")
        .fetch_one(pool)
        .await
        .context("Failed to count running jobs")?;
    Ok(row.0)
}

/// Count jobs of a type created within the given window.
pub async fn count_recent_jobs_of_type(
    pool: &SqlitePool,
    job_type: JobType,
    within: Duration,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r"
        SELECT COUNT(*) FROM scrape_jobs
        WHERE job_type = ?
          AND created_at > datetime('now', ?)
        ",
    )
    .bind(job_type.as_str())
    .bind(seconds_ago_modifier(within))
    .fetch_one(pool)
    .await
    .context("Failed to count recent jobs by type")?;
    Ok(row.0)
}

/// Move a QUEUED job to RUNNING.
///
/// Cancel and progress keys left by an earlier run are cleared in the same
/// transaction, so a cancel flag set after the transition survives until the
/// job observes it. Returns `false` when the job was not QUEUED (already
/// picked up or cancelled).
pub async fn mark_job_running(pool: &SqlitePool, id: i64) -> Result<bool> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    sqlx::query(
        r"
        DELETE FROM settings
        WHERE key IN (?, ?)
          AND EXISTS (SELECT 1 FROM scrape_jobs WHERE id = ? AND status = 'QUEUED')
        ",
    )
    .bind(cancel_key(id))
    .bind(progress_key(id))
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("Failed to clear job keys")?;

    let result = sqlx::query(
        r"
        UPDATE scrape_jobs
        SET status = 'RUNNING',
            started_at = datetime('now'),
            updated_at = datetime('now'),
            error_message = NULL
        WHERE id = ? AND status = 'QUEUED'
        ",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("Failed to mark job running")?;

    tx.commit().await.context("Failed to commit job start")?;
    Ok(result.rows_affected() == 1)
}

/// Move a RUNNING job to a terminal status.
///
/// Returns `false` when the job was no longer RUNNING (e.g. already failed as stale).
pub async fn finish_job(
    pool: &SqlitePool,
    id: i64,
    status: JobStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    anyhow::ensure!(
        status.is_terminal(),
        "cannot finish job with non-terminal status {}",
        status.as_str()
    );

    let result = sqlx::query(
        r"
        UPDATE scrape_jobs
        SET status = ?,
            error_message = ?,
            completed_at = datetime('now'),
            updated_at = datetime('now')
        WHERE id = ? AND status = 'RUNNING'
        ",
    )
    .bind(status.as_str())
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to finish job")?;

    Ok(result.rows_affected() == 1)
}

/// Cancel a job that never started.
///
/// Returns `false` when the job was not QUEUED.
pub async fn cancel_queued_job(pool: &SqlitePool, id: i64, message: &str) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE scrape_jobs
        SET status = 'CANCELLED',
            error_message = ?,
            completed_at = datetime('now'),
            updated_at = datetime('now')
        WHERE id = ? AND status = 'QUEUED'
        ",
    )
    .bind(message)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to cancel queued job")?;

    Ok(result.rows_affected() == 1)
}

/// Refresh a job's `updated_at` so the stale detector sees it as alive.
pub async fn touch_job(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE scrape_jobs SET updated_at = datetime('now') WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to touch job")?;

    Ok(())
}

/// Partial update of a job's result fields. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub result_count: Option<i64>,
    pub sheet_synced: Option<i64>,
    pub result_path: Option<String>,
    pub error_message: Option<String>,
}

/// Apply a [`JobPatch`] to a job.
pub async fn update_job(pool: &SqlitePool, id: i64, patch: &JobPatch) -> Result<()> {
    sqlx::query(
        r"
        UPDATE scrape_jobs
        SET result_count = COALESCE(?, result_count),
            sheet_synced = COALESCE(?, sheet_synced),
            result_path = COALESCE(?, result_path),
            error_message = COALESCE(?, error_message),
            updated_at = datetime('now')
        WHERE id = ?
        ",
    )
    .bind(patch.result_count)
    .bind(patch.sheet_synced)
    .bind(&patch.result_path)
    .bind(&patch.error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to update job")?;

    Ok(())
}

/// Fail every RUNNING job with no update inside `window`.
///
/// Returns the IDs of the jobs that were failed.
pub async fn fail_stale_jobs(pool: &SqlitePool, window: Duration, message: &str) -> Result<Vec<i64>> {
    let modifier = seconds_ago_modifier(window);
    let stale: Vec<(i64,)> = sqlx::query_as(
        r"
        SELECT id FROM scrape_jobs
        WHERE status = 'RUNNING'
          AND updated_at < datetime('now', ?)
        ORDER BY id ASC
        ",
    )
    .bind(&modifier)
    .fetch_all(pool)
    .await
    .context("Failed to find stale jobs")?;

    let mut failed = Vec::with_capacity(stale.len());
    for (id,) in stale {
        // Re-check the predicate so a job that just reported progress survives.
        let result = sqlx::query(
            r"
            UPDATE scrape_jobs
            SET status = 'FAILED',
                error_message = ?,
                completed_at = datetime('now'),
                updated_at = datetime('now')
            WHERE id = ? AND status = 'RUNNING' AND updated_at < datetime('now', ?)
            ",
        )
        .bind(message)
        .bind(id)
        .bind(&modifier)
        .execute(pool)
        .await
        .context("Failed to fail stale job")?;

        if result.rows_affected() == 1 {
            failed.push(id);
        }
    }

    Ok(failed)
}

// ========== Settings ==========

/// Get a setting value by key.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<Setting> = sqlx::query_as("SELECT * FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch setting")?;
    Ok(row.map(|s| s.value))
}

/// Insert or replace a setting value.
pub async fn upsert_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        ",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to upsert setting")?;

    Ok(())
}

/// Delete settings by key. Missing keys are ignored.
pub async fn delete_settings(pool: &SqlitePool, keys: &[String]) -> Result<u64> {
    let mut deleted = 0;
    for key in keys {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(pool)
            .await
            .context("Failed to delete setting")?;
        deleted += result.rows_affected();
    }
    Ok(deleted)
}

// ========== Posts ==========

/// Check whether a post is a duplicate of one already stored.
///
/// A post is a duplicate when its content hash exists, or when the same URL
/// was stored with the same hash. A known URL with a different hash is new.
pub async fn is_duplicate_post(
    pool: &SqlitePool,
    source_url: &str,
    content_hash: &str,
) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        r"
        SELECT COUNT(*) FROM parsed_posts
        WHERE content_hash = ?
           OR (source_url = ? AND content_hash = ?)
        ",
    )
    .bind(content_hash)
    .bind(source_url)
    .bind(content_hash)
    .fetch_one(pool)
    .await
    .context("Failed to check for duplicate post")?;

    Ok(row.0 > 0)
}

/// Insert a post for a job.
///
/// Returns `None` if a row with the same content hash already exists.
pub async fn insert_post(pool: &SqlitePool, job_id: i64, post: &ParsedPost) -> Result<Option<i64>> {
    let result = sqlx::query(
        r"
        INSERT OR IGNORE INTO parsed_posts (
            job_id, source_url, cafe_id, cafe_name, cafe_url, title, author,
            published_at, view_count, like_count, comment_count, body_text,
            comments_text, content_text, content_hash, raw_html
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(job_id)
    .bind(&post.source_url)
    .bind(&post.cafe_id)
    .bind(&post.cafe_name)
    .bind(&post.cafe_url)
    .bind(&post.title)
    .bind(&post.author)
    .bind(&post.published_at)
    .bind(post.view_count)
    .bind(post.like_count)
    .bind(post.comment_count)
    .bind(&post.body_text)
    .bind(&post.comments_text)
    .bind(&post.content_text)
    .bind(&post.content_hash)
    .bind(&post.raw_html)
    .execute(pool)
    .await
    .context("Failed to insert parsed post")?;

    Ok((result.rows_affected() == 1).then(|| result.last_insert_rowid()))
}

/// Get all posts stored by a job, in insertion order.
pub async fn get_posts_for_job(pool: &SqlitePool, job_id: i64) -> Result<Vec<StoredPost>> {
    sqlx::query_as("SELECT * FROM parsed_posts WHERE job_id = ? ORDER BY id ASC")
        .bind(job_id)
        .fetch_all(pool)
        .await
        .context("Failed to fetch posts for job")
}

/// Count posts stored by a job.
pub async fn count_posts_for_job(pool: &SqlitePool, job_id: i64) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM parsed_posts WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .context("Failed to count posts for job")?;
    Ok(row.0)
}

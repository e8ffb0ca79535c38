//! SQLite job store shared by the dispatcher and worker processes.

mod migrations;
mod models;
mod queries;

pub use models::*;
pub use queries::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, info};

/// How long a writer waits for the other process to release its lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_CONNECTIONS: u32 = 5;

fn connect_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the job store at `path`, creating its directory and schema as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or written, or a migration fails.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(connect_options(path))
            .await
            .with_context(|| format!("Failed to open job store at {}", path.display()))?;

        let db = Self { pool };
        migrations::run(&db.pool).await?;
        info!(path = %path.display(), "Job store ready");
        db.check_writable(path).await?;

        Ok(db)
    }

    /// Take the write lock once and roll back, so a read-only file fails at startup.
    async fn check_writable(&self, path: &Path) -> Result<()> {
        let not_writable = || format!("Job store is not writable: {}", path.display());
        let mut tx = self.pool.begin().await.with_context(not_writable)?;
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind("__write_check")
            .execute(&mut *tx)
            .await
            .with_context(not_writable)?;
        tx.rollback().await.context("Failed to roll back write check")?;
        debug!("Job store write check passed");
        Ok(())
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating initial schema");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS scrape_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_type TEXT NOT NULL DEFAULT 'SCRAPE',
            status TEXT NOT NULL DEFAULT 'QUEUED',
            keywords TEXT NOT NULL DEFAULT '[]',
            direct_urls TEXT NOT NULL DEFAULT '[]',
            include_words TEXT NOT NULL DEFAULT '[]',
            exclude_words TEXT NOT NULL DEFAULT '[]',
            exclude_boards TEXT NOT NULL DEFAULT '[]',
            from_date TEXT,
            to_date TEXT,
            min_view_count INTEGER,
            min_comment_count INTEGER,
            use_auto_filter INTEGER NOT NULL DEFAULT 0,
            max_posts INTEGER NOT NULL DEFAULT 50,
            cafe_ids TEXT NOT NULL DEFAULT '[]',
            cafe_names TEXT NOT NULL DEFAULT '[]',
            result_count INTEGER NOT NULL DEFAULT 0,
            sheet_synced INTEGER NOT NULL DEFAULT 0,
            result_path TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            started_at TEXT,
            completed_at TEXT
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create scrape_jobs table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scrape_jobs_status_created ON scrape_jobs(status, created_at)",
    )
    .execute(pool)
    .await
    .context("Failed to create scrape_jobs status index")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS parsed_posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL REFERENCES scrape_jobs(id) ON DELETE CASCADE,
            source_url TEXT NOT NULL,
            cafe_id TEXT NOT NULL,
            cafe_name TEXT NOT NULL DEFAULT '',
            cafe_url TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            published_at TEXT,
            view_count INTEGER NOT NULL DEFAULT 0,
            like_count INTEGER NOT NULL DEFAULT 0,
            comment_count INTEGER NOT NULL DEFAULT 0,
            body_text TEXT NOT NULL DEFAULT '',
            comments_text TEXT NOT NULL DEFAULT '',
            content_text TEXT NOT NULL DEFAULT '',
            content_hash TEXT NOT NULL UNIQUE,
            raw_html TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create parsed_posts table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_parsed_posts_job ON parsed_posts(job_id)")
        .execute(pool)
        .await
        .context("Failed to create parsed_posts job index")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_parsed_posts_source_url ON parsed_posts(source_url)",
    )
    .execute(pool)
    .await
    .context("Failed to create parsed_posts url index")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create settings table")?;

    Ok(())
}

async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v2: job type index for maintenance scheduling");

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scrape_jobs_type_created ON scrape_jobs(job_type, created_at)",
    )
    .execute(pool)
    .await
    .context("Failed to create scrape_jobs type index")?;

    Ok(())
}

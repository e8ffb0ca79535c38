//! Shared constants used across the application.

/// User agent string used for search API requests and the rendering browser.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Hard bounds for a job's `max_posts`.
pub const MIN_MAX_POSTS: i64 = 1;
pub const MAX_MAX_POSTS: i64 = 300;

/// Settings key holding the encrypted browsing session.
pub const SESSION_SETTING_KEY: &str = "naver_session";

/// Settings key holding the last joined-cafe refresh result.
pub const JOINED_CAFES_SETTING_KEY: &str = "joined_cafes";

/// Settings key holding the dispatcher heartbeat.
pub const HEARTBEAT_SETTING_KEY: &str = "worker_heartbeat";

/// Settings key for a job's progress snapshot.
#[must_use]
pub fn progress_key(job_id: i64) -> String {
    format!("scrape_progress:{job_id}")
}

/// Settings key for a job's cancel flag.
#[must_use]
pub fn cancel_key(job_id: i64) -> String {
    format!("scrape_cancel:{job_id}")
}

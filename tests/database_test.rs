//! Integration tests for the job store.

mod common;

use std::time::Duration;

use cafe_archiver::db::{
    cancel_queued_job, count_posts_for_job, count_recent_jobs_of_type, count_running_jobs,
    create_job, delete_settings, fail_stale_jobs, finish_job, get_job, get_posts_for_job,
    get_setting, insert_post, is_duplicate_post, list_jobs_by_status, mark_job_running,
    update_job, upsert_setting, JobMode, JobPatch, JobStatus, JobType, NewScrapeJob, ParsedPost,
};
use cafe_archiver::constants::{cancel_key, progress_key};
use common::setup_db;

fn keyword_job() -> NewScrapeJob {
    NewScrapeJob {
        keywords: vec!["집중".to_string()],
        cafe_ids: vec!["12345".to_string()],
        cafe_names: vec!["공부카페".to_string()],
        max_posts: 20,
        ..NewScrapeJob::default()
    }
}

fn post(url: &str, hash: &str) -> ParsedPost {
    ParsedPost {
        source_url: url.to_string(),
        cafe_id: "12345".to_string(),
        title: "집중하는 법".to_string(),
        content_text: "본문".to_string(),
        content_hash: hash.to_string(),
        ..ParsedPost::default()
    }
}

#[tokio::test]
async fn test_create_and_get_job() {
    let (db, _temp_dir) = setup_db().await;

    let id = create_job(db.pool(), &keyword_job(), JobType::Scrape)
        .await
        .expect("Failed to create job");
    let job = get_job(db.pool(), id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");

    assert_eq!(job.status_enum(), Some(JobStatus::Queued));
    assert_eq!(job.job_type_enum(), Some(JobType::Scrape));
    assert_eq!(job.keywords(), vec!["집중"]);
    assert_eq!(job.max_posts, 20);
    assert!(job.started_at.is_none());
    assert!(matches!(job.mode(), JobMode::Keywords { ref cafes, .. } if cafes[0].name == "공부카페"));
}

#[tokio::test]
async fn test_scrape_job_needs_urls_or_keywords_and_cafes() {
    let (db, _temp_dir) = setup_db().await;

    let no_cafe = NewScrapeJob {
        keywords: vec!["집중".to_string()],
        ..NewScrapeJob::default()
    };
    assert!(create_job(db.pool(), &no_cafe, JobType::Scrape).await.is_err());
    assert!(create_job(db.pool(), &NewScrapeJob::default(), JobType::Scrape).await.is_err());

    let urls_only = NewScrapeJob {
        direct_urls: vec!["https://cafe.naver.com/studycafe/1".to_string()],
        ..NewScrapeJob::default()
    };
    assert!(create_job(db.pool(), &urls_only, JobType::Scrape).await.is_ok());
    // Maintenance jobs carry no inputs.
    assert!(create_job(db.pool(), &NewScrapeJob::default(), JobType::RefreshCafes).await.is_ok());
}

#[tokio::test]
async fn test_max_posts_is_clamped_on_insert() {
    let (db, _temp_dir) = setup_db().await;

    let huge = NewScrapeJob {
        max_posts: 10_000,
        ..keyword_job()
    };
    let unset = NewScrapeJob {
        max_posts: 0,
        ..keyword_job()
    };
    let a = create_job(db.pool(), &huge, JobType::Scrape).await.expect("create");
    let b = create_job(db.pool(), &unset, JobType::Scrape).await.expect("create");

    assert_eq!(get_job(db.pool(), a).await.expect("get").expect("job").max_posts, 300);
    assert_eq!(get_job(db.pool(), b).await.expect("get").expect("job").max_posts, 1);
}

#[tokio::test]
async fn test_status_transitions_are_guarded() {
    let (db, _temp_dir) = setup_db().await;
    let id = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");

    // Finishing a job that never started does nothing.
    assert!(!finish_job(db.pool(), id, JobStatus::Success, None).await.expect("finish"));

    assert!(mark_job_running(db.pool(), id).await.expect("start"));
    assert!(!mark_job_running(db.pool(), id).await.expect("second start"));
    assert_eq!(count_running_jobs(db.pool()).await.expect("count"), 1);

    assert!(finish_job(db.pool(), id, JobStatus::Success, None).await.expect("finish"));
    assert!(!finish_job(db.pool(), id, JobStatus::Failed, Some("late")).await.expect("refinish"));

    let job = get_job(db.pool(), id).await.expect("get").expect("job");
    assert_eq!(job.status_enum(), Some(JobStatus::Success));
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_none());
    assert_eq!(count_running_jobs(db.pool()).await.expect("count"), 0);
}

#[tokio::test]
async fn test_claiming_a_job_clears_leftover_keys_only_once() {
    let (db, _temp_dir) = setup_db().await;
    let id = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");
    upsert_setting(db.pool(), &cancel_key(id), "1").await.expect("upsert");
    upsert_setting(db.pool(), &progress_key(id), "{}").await.expect("upsert");

    assert!(mark_job_running(db.pool(), id).await.expect("start"));
    assert!(get_setting(db.pool(), &cancel_key(id)).await.expect("get").is_none());
    assert!(get_setting(db.pool(), &progress_key(id)).await.expect("get").is_none());

    // A cancel set for the running job survives a repeated claim attempt.
    upsert_setting(db.pool(), &cancel_key(id), "1").await.expect("upsert");
    assert!(!mark_job_running(db.pool(), id).await.expect("start"));
    assert_eq!(
        get_setting(db.pool(), &cancel_key(id)).await.expect("get").as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn test_finish_rejects_non_terminal_status() {
    let (db, _temp_dir) = setup_db().await;
    let id = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");
    mark_job_running(db.pool(), id).await.expect("start");

    assert!(finish_job(db.pool(), id, JobStatus::Queued, None).await.is_err());
}

#[tokio::test]
async fn test_cancel_only_applies_to_queued_jobs() {
    let (db, _temp_dir) = setup_db().await;
    let queued = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");
    let running = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");
    mark_job_running(db.pool(), running).await.expect("start");

    assert!(cancel_queued_job(db.pool(), queued, "stop").await.expect("cancel"));
    assert!(!cancel_queued_job(db.pool(), running, "stop").await.expect("cancel"));

    let job = get_job(db.pool(), queued).await.expect("get").expect("job");
    assert_eq!(job.status_enum(), Some(JobStatus::Cancelled));
    assert_eq!(job.error_message.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_queue_is_oldest_first() {
    let (db, _temp_dir) = setup_db().await;
    let first = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");
    let second = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");

    let queued = list_jobs_by_status(db.pool(), JobStatus::Queued, 10).await.expect("list");
    let ids: Vec<i64> = queued.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![first, second]);
}

#[tokio::test]
async fn test_stale_jobs_are_failed() {
    let (db, _temp_dir) = setup_db().await;
    let stale = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");
    let fresh = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");
    mark_job_running(db.pool(), stale).await.expect("start");
    mark_job_running(db.pool(), fresh).await.expect("start");

    sqlx::query("UPDATE scrape_jobs SET updated_at = datetime('now', '-2 hours') WHERE id = ?")
        .bind(stale)
        .execute(db.pool())
        .await
        .expect("backdate");

    let failed = fail_stale_jobs(db.pool(), Duration::from_secs(600), "stale")
        .await
        .expect("sweep");
    assert_eq!(failed, vec![stale]);

    let job = get_job(db.pool(), stale).await.expect("get").expect("job");
    assert_eq!(job.status_enum(), Some(JobStatus::Failed));
    assert_eq!(job.error_message.as_deref(), Some("stale"));
    let job = get_job(db.pool(), fresh).await.expect("get").expect("job");
    assert_eq!(job.status_enum(), Some(JobStatus::Running));
}

#[tokio::test]
async fn test_update_job_patch_leaves_unset_columns() {
    let (db, _temp_dir) = setup_db().await;
    let id = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");

    update_job(
        db.pool(),
        id,
        &JobPatch {
            result_count: Some(7),
            result_path: Some("/tmp/job.json".to_string()),
            ..JobPatch::default()
        },
    )
    .await
    .expect("patch");
    update_job(
        db.pool(),
        id,
        &JobPatch {
            sheet_synced: Some(5),
            ..JobPatch::default()
        },
    )
    .await
    .expect("patch");

    let job = get_job(db.pool(), id).await.expect("get").expect("job");
    assert_eq!(job.result_count, 7);
    assert_eq!(job.sheet_synced, 5);
    assert_eq!(job.result_path.as_deref(), Some("/tmp/job.json"));
}

#[tokio::test]
async fn test_recent_jobs_of_type() {
    let (db, _temp_dir) = setup_db().await;
    create_job(db.pool(), &NewScrapeJob::default(), JobType::RefreshCafes)
        .await
        .expect("create");

    let window = Duration::from_secs(3600);
    assert_eq!(
        count_recent_jobs_of_type(db.pool(), JobType::RefreshCafes, window).await.expect("count"),
        1
    );
    assert_eq!(
        count_recent_jobs_of_type(db.pool(), JobType::Scrape, window).await.expect("count"),
        0
    );
}

#[tokio::test]
async fn test_settings_upsert_and_delete() {
    let (db, _temp_dir) = setup_db().await;

    assert!(get_setting(db.pool(), "k").await.expect("get").is_none());
    upsert_setting(db.pool(), "k", "1").await.expect("set");
    upsert_setting(db.pool(), "k", "2").await.expect("overwrite");
    assert_eq!(get_setting(db.pool(), "k").await.expect("get").as_deref(), Some("2"));

    let deleted = delete_settings(db.pool(), &["k".to_string(), "missing".to_string()])
        .await
        .expect("delete");
    assert_eq!(deleted, 1);
    assert!(get_setting(db.pool(), "k").await.expect("get").is_none());
}

#[tokio::test]
async fn test_post_dedup_by_hash() {
    let (db, _temp_dir) = setup_db().await;
    let job = create_job(db.pool(), &keyword_job(), JobType::Scrape).await.expect("create");
    let url = "https://cafe.naver.com/ArticleRead.nhn?clubid=12345&articleid=1";

    assert!(!is_duplicate_post(db.pool(), url, "h1").await.expect("check"));
    assert!(insert_post(db.pool(), job, &post(url, "h1")).await.expect("insert").is_some());

    assert!(is_duplicate_post(db.pool(), url, "h1").await.expect("check"));
    assert!(insert_post(db.pool(), job, &post(url, "h1")).await.expect("insert").is_none());

    // Same URL with changed content is a new version.
    assert!(!is_duplicate_post(db.pool(), url, "h2").await.expect("check"));
    assert!(insert_post(db.pool(), job, &post(url, "h2")).await.expect("insert").is_some());

    assert_eq!(count_posts_for_job(db.pool(), job).await.expect("count"), 2);
    let stored = get_posts_for_job(db.pool(), job).await.expect("posts");
    assert_eq!(stored[0].content_hash, "h1");
    assert_eq!(stored[1].content_hash, "h2");
}

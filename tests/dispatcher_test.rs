//! Dispatcher ticks: single flight, stale recovery, cancellation and maintenance jobs.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cafe_archiver::config::Config;
use cafe_archiver::constants::{cancel_key, progress_key, JOINED_CAFES_SETTING_KEY};
use cafe_archiver::db::{
    create_job, get_job, get_setting, mark_job_running, upsert_setting, Database, JobStatus, JobType,
    NewScrapeJob,
};
use cafe_archiver::dispatcher::{summary, InProcessExecutor, JobExecutor, QueueDispatcher, TickAction};
use cafe_archiver::progress::{read_heartbeat, request_cancel, CancelOutcome};
use cafe_archiver::runner::JobRunner;
use cafe_archiver::sink::Notifier;
use common::{article_html, modern_article_url, setup_db, test_config, FakeBrowser};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, job_id: i64, text: &str) {
        self.messages
            .lock()
            .expect("messages lock")
            .push((job_id, text.to_string()));
    }
}

fn placeholder_job() -> NewScrapeJob {
    NewScrapeJob {
        keywords: vec!["집중".to_string()],
        cafe_ids: vec!["77".to_string()],
        ..NewScrapeJob::default()
    }
}

struct FailingExecutor;

#[async_trait]
impl JobExecutor for FailingExecutor {
    async fn execute(&self, _job_id: i64) -> Result<()> {
        anyhow::bail!("worker binary not found")
    }
}

struct Harness {
    server: MockServer,
    db: Database,
    config: Config,
    notifier: Arc<RecordingNotifier>,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let (db, dir) = setup_db().await;
        let config = test_config(dir.path(), &server.uri());
        Self {
            server,
            db,
            config,
            notifier: Arc::new(RecordingNotifier::default()),
            _dir: dir,
        }
    }

    fn dispatcher(&self, executor: Arc<dyn JobExecutor>) -> QueueDispatcher {
        QueueDispatcher::new(
            self.config.clone(),
            self.db.clone(),
            executor,
            self.notifier.clone(),
        )
    }

    fn inline_dispatcher(&self, browser: &FakeBrowser) -> QueueDispatcher {
        let runner = JobRunner::new(
            self.config.clone(),
            self.db.clone(),
            Arc::new(browser.clone()),
            None,
        );
        self.dispatcher(Arc::new(InProcessExecutor::new(runner)))
    }

    /// A direct-URL job whose single page is served by the returned browser.
    async fn direct_job(&self, article_id: u64) -> (i64, FakeBrowser) {
        let url = modern_article_url(&self.server.uri(), "77", article_id);
        let browser = FakeBrowser::new(HashMap::from([(
            url.clone(),
            article_html("공지", &format!("스터디 안내 {article_id}"), 5),
        )]));
        let job = NewScrapeJob {
            direct_urls: vec![url],
            max_posts: 5,
            ..NewScrapeJob::default()
        };
        let id = create_job(self.db.pool(), &job, JobType::Scrape)
            .await
            .expect("create");
        (id, browser)
    }

    async fn status(&self, job_id: i64) -> Option<JobStatus> {
        get_job(self.db.pool(), job_id)
            .await
            .expect("get")
            .and_then(|job| job.status_enum())
    }
}

#[tokio::test]
async fn test_idle_tick_writes_heartbeat() {
    let h = Harness::new().await;
    let mut dispatcher = h.inline_dispatcher(&FakeBrowser::default());

    let report = dispatcher.tick().await.expect("tick");

    assert_eq!(report.action, TickAction::Idle);
    assert!(report.stale_failed.is_empty());
    let heartbeat = read_heartbeat(h.db.pool()).await.expect("read").expect("heartbeat");
    assert_eq!(heartbeat.pid, std::process::id());
}

#[tokio::test]
async fn test_queued_job_runs_to_success() {
    let h = Harness::new().await;
    let (job_id, browser) = h.direct_job(1).await;
    let mut dispatcher = h.inline_dispatcher(&browser);

    let report = dispatcher.tick().await.expect("tick");

    assert_eq!(
        report.action,
        TickAction::Executed {
            job_id,
            job_type: JobType::Scrape,
            status: Some(JobStatus::Success),
        }
    );
    let messages = h.notifier.messages.lock().expect("lock").clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, job_id);
    assert!(messages[0].1.contains("SUCCESS"));
}

#[tokio::test]
async fn test_running_job_blocks_queue() {
    let h = Harness::new().await;
    let running = create_job(h.db.pool(), &placeholder_job(), JobType::Scrape)
        .await
        .expect("create");
    mark_job_running(h.db.pool(), running).await.expect("start");
    let (queued, browser) = h.direct_job(2).await;
    let mut dispatcher = h.inline_dispatcher(&browser);

    let report = dispatcher.tick().await.expect("tick");

    assert_eq!(report.action, TickAction::Busy);
    assert_eq!(h.status(queued).await, Some(JobStatus::Queued));
    assert!(browser.visits().is_empty());
}

#[tokio::test]
async fn test_stale_job_is_failed_then_queue_proceeds() {
    let h = Harness::new().await;
    let stale = create_job(h.db.pool(), &placeholder_job(), JobType::Scrape)
        .await
        .expect("create");
    mark_job_running(h.db.pool(), stale).await.expect("start");
    upsert_setting(h.db.pool(), &cancel_key(stale), "1").await.expect("flag");
    sqlx::query("UPDATE scrape_jobs SET updated_at = datetime('now', '-1 hour') WHERE id = ?")
        .bind(stale)
        .execute(h.db.pool())
        .await
        .expect("backdate");
    let (queued, browser) = h.direct_job(3).await;
    let mut dispatcher = h.inline_dispatcher(&browser);

    let report = dispatcher.tick().await.expect("tick");

    assert_eq!(report.stale_failed, vec![stale]);
    assert!(matches!(report.action, TickAction::Executed { job_id, .. } if job_id == queued));
    let job = get_job(h.db.pool(), stale).await.expect("get").expect("job");
    assert_eq!(job.status_enum(), Some(JobStatus::Failed));
    assert!(job.error_message.unwrap_or_default().starts_with("Stale"));
    assert!(get_setting(h.db.pool(), &cancel_key(stale)).await.expect("get").is_none());
    assert_eq!(h.status(queued).await, Some(JobStatus::Success));
}

#[tokio::test]
async fn test_cancel_queued_job_leaves_no_keys() {
    let h = Harness::new().await;
    let (job_id, browser) = h.direct_job(4).await;

    let outcome = request_cancel(h.db.pool(), job_id).await.expect("cancel");

    assert_eq!(outcome, CancelOutcome::CancelledQueued);
    assert_eq!(h.status(job_id).await, Some(JobStatus::Cancelled));
    assert!(get_setting(h.db.pool(), &cancel_key(job_id)).await.expect("get").is_none());
    assert!(get_setting(h.db.pool(), &progress_key(job_id)).await.expect("get").is_none());

    let mut dispatcher = h.inline_dispatcher(&browser);
    assert_eq!(dispatcher.tick().await.expect("tick").action, TickAction::Idle);
    assert!(browser.visits().is_empty());
}

#[tokio::test]
async fn test_request_cancel_outcomes() {
    let h = Harness::new().await;
    let running = create_job(h.db.pool(), &placeholder_job(), JobType::Scrape)
        .await
        .expect("create");
    mark_job_running(h.db.pool(), running).await.expect("start");

    assert_eq!(
        request_cancel(h.db.pool(), running).await.expect("cancel"),
        CancelOutcome::FlagSet
    );
    assert_eq!(
        get_setting(h.db.pool(), &cancel_key(running)).await.expect("get").as_deref(),
        Some("1")
    );
    assert_eq!(h.status(running).await, Some(JobStatus::Running));

    assert_eq!(
        request_cancel(h.db.pool(), 9_999).await.expect("cancel"),
        CancelOutcome::NotFound
    );

    let (done, _) = h.direct_job(5).await;
    request_cancel(h.db.pool(), done).await.expect("cancel");
    assert_eq!(
        request_cancel(h.db.pool(), done).await.expect("cancel"),
        CancelOutcome::AlreadyFinished
    );
}

#[tokio::test]
async fn test_executor_error_fails_job() {
    let h = Harness::new().await;
    let (job_id, _) = h.direct_job(6).await;
    let mut dispatcher = h.dispatcher(Arc::new(FailingExecutor));

    let report = dispatcher.tick().await.expect("tick");

    assert_eq!(
        report.action,
        TickAction::Executed {
            job_id,
            job_type: JobType::Scrape,
            status: Some(JobStatus::Failed),
        }
    );
    let job = get_job(h.db.pool(), job_id).await.expect("get").expect("job");
    assert!(job.error_message.clone().unwrap_or_default().contains("worker binary not found"));
    assert!(summary(&job).contains("FAILED"));
}

#[tokio::test]
async fn test_due_refresh_runs_before_queue() {
    let mut h = Harness::new().await;
    h.config.cafe_refresh_interval = Some(Duration::from_secs(3600));
    Mock::given(method("GET"))
        .and(path("/cafe-web/cafe-mobile/CafeMobileWebJoinedCafeListV2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"result": {"cafeList": [
                {"cafeId": 77, "cafeUrl": "studycafe", "cafeName": "공부카페"},
                {"cafeId": 88, "cafeUrl": "runners", "cafeName": "<b>달리기</b>"}
            ]}}
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    let (queued, browser) = h.direct_job(7).await;
    let mut dispatcher = h.inline_dispatcher(&browser);

    let first = dispatcher.tick().await.expect("tick");
    let TickAction::Executed { job_id, job_type, status } = first.action else {
        panic!("expected the refresh job to run, got {:?}", first.action);
    };
    assert_eq!(job_type, JobType::RefreshCafes);
    assert_eq!(status, Some(JobStatus::Success));
    assert_eq!(
        get_job(h.db.pool(), job_id).await.expect("get").expect("job").result_count,
        2
    );

    let stored: Value = serde_json::from_str(
        &get_setting(h.db.pool(), JOINED_CAFES_SETTING_KEY)
            .await
            .expect("get")
            .expect("joined cafes stored"),
    )
    .expect("json");
    assert_eq!(stored["cafes"][1]["cafeName"], "달리기");
    assert_eq!(h.status(queued).await, Some(JobStatus::Queued));

    // The refresh is not due again within the interval; the queue runs next.
    let second = dispatcher.tick().await.expect("tick");
    assert!(matches!(second.action, TickAction::Executed { job_id, .. } if job_id == queued));
}

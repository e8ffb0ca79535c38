//! Execution of a single job, from RUNNING to a terminal status.
//!
//! The runner owns the per-job pipeline: session, candidate collection,
//! extraction, filtering, persistence, sink delivery and progress. It is
//! used both inline by the dispatcher and by the `scrape-worker` binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::browser::{ChromeBrowser, PageDriver, PageFactory};
use crate::collector::{
    cafe_budget, is_numeric_id, merge_candidates, parse_article_ref, per_keyword_take, DateWindow,
    SearchClient, SearchQuery,
};
use crate::config::Config;
use crate::constants::JOINED_CAFES_SETTING_KEY;
use crate::db::{
    finish_job, get_job, insert_post, is_duplicate_post, mark_job_running, update_job, upsert_setting,
    CafeTarget, Database, JobMode, JobPatch, JobStatus, JobType, ParsedPost, ScrapeJob,
};
use crate::error::{JobError, JobResult};
use crate::extractor::{cafe_url, ContentExtractor, ExtractTarget, Extraction};
use crate::filter::FilterPlan;
use crate::progress::{PairStatus, ProgressChannel, Stage};
use crate::session::load_session;
use crate::sink::{sink_from_config, RowSink, SheetRow, SinkBuffer};

const CANCELLED_MESSAGE: &str = "Cancelled by request";

/// Terminal result of one job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: i64,
    pub status: JobStatus,
    pub result_count: usize,
    pub sheet_synced: usize,
    pub error_message: Option<String>,
}

/// Runs jobs against the store, a browser and an optional row sink.
#[derive(Clone)]
pub struct JobRunner {
    config: Config,
    db: Database,
    pages: Arc<dyn PageFactory>,
    sink: Option<Arc<dyn RowSink>>,
}

impl JobRunner {
    #[must_use]
    pub fn new(
        config: Config,
        db: Database,
        pages: Arc<dyn PageFactory>,
        sink: Option<Arc<dyn RowSink>>,
    ) -> Self {
        Self {
            config,
            db,
            pages,
            sink,
        }
    }

    /// Production wiring: headless Chromium and the configured sheet webhook.
    pub fn from_config(config: Config, db: Database) -> Result<Self> {
        let pages: Arc<dyn PageFactory> = Arc::new(ChromeBrowser::new(&config));
        let sink = sink_from_config(&config)?;
        Ok(Self::new(config, db, pages, sink))
    }

    fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    /// Run a QUEUED or already-RUNNING job to a terminal status and record it.
    ///
    /// Errors are returned only when the job cannot be started or its terminal
    /// status cannot be written; job failures become a FAILED outcome.
    pub async fn execute(&self, job_id: i64) -> Result<JobOutcome> {
        let job = get_job(self.pool(), job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        match job.status_enum() {
            Some(JobStatus::Queued) => {
                if !mark_job_running(self.pool(), job_id).await? {
                    return Err(JobError::InvalidState {
                        id: job_id,
                        reason: "no longer QUEUED".to_string(),
                    }
                    .into());
                }
            }
            Some(JobStatus::Running) => {}
            _ => {
                return Err(JobError::InvalidState {
                    id: job_id,
                    reason: format!("status is {}", job.status),
                }
                .into());
            }
        }

        info!(job_id, job_type = %job.job_type, "Starting job");
        let progress = ProgressChannel::start(self.pool().clone(), job_id);
        let mut run = JobRun::new(&self.config, self.pool(), &job, progress, self.sink.clone());

        let result = match job.job_type_enum() {
            Some(JobType::Scrape) => self.scrape(&job, &mut run).await,
            Some(JobType::RefreshCafes) => self.refresh_cafes(&mut run).await,
            None => Err(JobError::InvalidState {
                id: job_id,
                reason: format!("unknown job type {}", job.job_type),
            }),
        };

        // Whatever was collected before a cancel or failure is still kept.
        let wrap_up = run.wrap_up().await;
        let result_path = match self.write_result_file(job_id, &run.persisted).await {
            Ok(path) => Some(path.display().to_string()),
            Err(e) => {
                warn!(job_id, "Failed to write result file: {e:#}");
                None
            }
        };

        let (status, stage, message) = match (result, wrap_up) {
            (Ok(()), Ok(())) => (JobStatus::Success, Stage::Done, None),
            (Err(e), _) if e.is_cancelled() => {
                info!(job_id, "Job cancelled");
                (JobStatus::Cancelled, Stage::Cancelled, Some(CANCELLED_MESSAGE.to_string()))
            }
            (Err(e), _) => {
                error!(job_id, "Job failed: {e:#}");
                (JobStatus::Failed, Stage::Failed, Some(format!("{e:#}")))
            }
            (Ok(()), Err(e)) => {
                error!(job_id, "Job failed while saving results: {e:#}");
                (JobStatus::Failed, Stage::Failed, Some(format!("{e:#}")))
            }
        };

        let result_count = run.result_count();
        let sheet_synced = run.sink.delivered();
        let patch = JobPatch {
            result_count: Some(result_count as i64),
            sheet_synced: Some(sheet_synced as i64),
            result_path,
            error_message: None,
        };
        if let Err(e) = update_job(self.pool(), job_id, &patch).await {
            warn!(job_id, "Failed to record job counts: {e:#}");
        }

        if let Err(e) = run.progress.finish(stage, message.clone()).await {
            warn!(job_id, "Failed to record final progress: {e:#}");
        }

        if !finish_job(self.pool(), job_id, status, message.as_deref()).await? {
            warn!(job_id, status = status.as_str(), "Job was no longer RUNNING; terminal status not applied");
        }

        info!(job_id, status = status.as_str(), result_count, sheet_synced, "Job finished");
        Ok(JobOutcome {
            job_id,
            status,
            result_count,
            sheet_synced,
            error_message: message,
        })
    }

    async fn scrape(&self, job: &ScrapeJob, run: &mut JobRun<'_>) -> JobResult<()> {
        let mode = job.mode();
        if let JobMode::Keywords { keywords, cafes } = &mode {
            if keywords.is_empty() || cafes.is_empty() {
                return Err(JobError::InvalidState {
                    id: job.id,
                    reason: "needs keywords and at least one cafe, or direct URLs".to_string(),
                });
            }
        }

        let session = load_session(&self.config, self.pool()).await?;
        let search = SearchClient::new(&self.config, session.clone())?;
        let page = self
            .pages
            .open(&session)
            .await
            .context("Failed to open browser page")?;

        let result = match &mode {
            JobMode::Keywords { keywords, cafes } => {
                self.scrape_keywords(job, keywords, cafes, page.as_ref(), &search, run)
                    .await
            }
            JobMode::DirectUrls(urls) => self.scrape_urls(urls, page.as_ref(), &search, run).await,
        };

        page.close().await;
        result
    }

    async fn scrape_keywords(
        &self,
        job: &ScrapeJob,
        keywords: &[String],
        cafes: &[CafeTarget],
        driver: &dyn PageDriver,
        search: &SearchClient,
        run: &mut JobRun<'_>,
    ) -> JobResult<()> {
        let extractor = ContentExtractor::new(&self.config, driver, search);
        let budget = cafe_budget(run.plan.max_posts, self.config.cafe_candidate_multiplier);
        let take = per_keyword_take(run.plan.max_posts, keywords.len());
        let pages_target = take.div_ceil(self.config.search_page_size.max(1));
        let window = DateWindow::from_bounds(job.from_date.as_deref(), job.to_date.as_deref());
        let exclude_boards = job.exclude_boards();

        run.progress.update(|p| {
            p.cafe_total = cafes.len();
            p.keyword_total = keywords.len();
        });

        for (cafe_index, cafe) in cafes.iter().enumerate() {
            if run.is_full() {
                break;
            }

            let cafe_id = match search.resolve_cafe_id(&cafe.id, Some(driver)).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(cafe = %cafe.id, "Skipping cafe, id not resolvable: {e:#}");
                    for keyword in keywords {
                        run.progress.pair_mut(&cafe.id, keyword).status = PairStatus::Failed;
                    }
                    run.progress.publish().await?;
                    continue;
                }
            };
            let cafe_link = cafe_url(&self.config.cafe_base_url, &cafe.id);

            let mut lists = Vec::with_capacity(keywords.len());
            for (keyword_index, keyword) in keywords.iter().enumerate() {
                run.progress.check_cancelled().await?;
                run.progress.update(|p| {
                    p.stage = Stage::Search;
                    p.cafe_id = Some(cafe_id.clone());
                    p.cafe_name = Some(cafe.name.clone());
                    p.cafe_index = cafe_index + 1;
                    p.keyword = Some(keyword.clone());
                    p.keyword_index = keyword_index + 1;
                });
                let pair = run.progress.pair_mut(&cafe_id, keyword);
                pair.status = PairStatus::Searching;
                pair.pages_target = pages_target;
                run.progress.publish().await?;

                let query = SearchQuery {
                    cafe_id: &cafe_id,
                    keyword,
                    budget: take,
                    exclude_boards: &exclude_boards,
                    window,
                };
                match search.search_keyword(&query).await {
                    Ok(outcome) => {
                        let found = outcome.candidates.len();
                        let pair = run.progress.pair_mut(&cafe_id, keyword);
                        pair.pages_scanned = outcome.pages_scanned;
                        pair.candidates = found;
                        pair.status = if found == 0 {
                            PairStatus::Skipped
                        } else {
                            PairStatus::Parsing
                        };
                        run.progress.update(|p| p.candidates += found);
                        lists.push(outcome.candidates);
                    }
                    Err(e) => {
                        warn!(cafe_id = %cafe_id, keyword = %keyword, "Search failed: {e:#}");
                        run.progress.pair_mut(&cafe_id, keyword).status = PairStatus::Failed;
                    }
                }
                run.progress.publish().await?;
            }

            let candidates = merge_candidates(lists, budget);
            let total = candidates.len();
            for (index, candidate) in candidates.iter().enumerate() {
                if run.is_full() {
                    break;
                }
                run.progress.check_cancelled().await?;
                run.progress.update(|p| {
                    p.stage = Stage::Parse;
                    p.keyword = Some(candidate.keyword.clone());
                    p.url = Some(candidate.url.clone());
                    p.url_index = index + 1;
                    p.url_total = total;
                    p.parse_attempts += 1;
                });
                run.progress.publish().await?;

                let target = ExtractTarget::from_candidate(candidate, &cafe.name, &cafe_link);
                let verdict = match extractor.extract(&target).await {
                    Extraction::Post(post) => Some(run.accept(*post, &candidate.subject).await?),
                    Extraction::Skipped(reason) => {
                        debug!(url = %candidate.url, reason = reason.as_str(), "Candidate skipped");
                        None
                    }
                };

                let pair = run.progress.pair_mut(&cafe_id, &candidate.keyword);
                match verdict {
                    Some(Verdict::Filtered) => pair.filtered += 1,
                    Some(_) => pair.collected += 1,
                    None => pair.skipped += 1,
                }
                run.progress.publish().await?;
            }

            for keyword in keywords {
                let pair = run.progress.pair_mut(&cafe_id, keyword);
                if pair.status == PairStatus::Parsing || pair.status == PairStatus::Searching {
                    pair.status = PairStatus::Done;
                }
            }
            run.progress.publish().await?;
        }

        Ok(())
    }

    async fn scrape_urls(
        &self,
        urls: &[String],
        driver: &dyn PageDriver,
        search: &SearchClient,
        run: &mut JobRun<'_>,
    ) -> JobResult<()> {
        let extractor = ContentExtractor::new(&self.config, driver, search);
        let base = self.config.cafe_base_url.as_str();

        for (index, url) in urls.iter().enumerate() {
            if run.is_full() {
                break;
            }
            run.progress.check_cancelled().await?;
            run.progress.update(|p| {
                p.stage = Stage::Parse;
                p.url = Some(url.clone());
                p.url_index = index + 1;
                p.url_total = urls.len();
                p.parse_attempts += 1;
            });
            run.progress.publish().await?;

            let target = match parse_article_ref(url) {
                Some(article) => {
                    let cafe_id = if is_numeric_id(&article.cafe) {
                        article.cafe.clone()
                    } else {
                        search
                            .resolve_cafe_id(&article.cafe, None)
                            .await
                            .unwrap_or_else(|e| {
                                debug!(cafe = %article.cafe, "Cafe id lookup failed: {e:#}");
                                article.cafe.clone()
                            })
                    };
                    let mut target =
                        ExtractTarget::from_direct_url(url, Some(&cafe_id), Some(article.article_id), base);
                    target.cafe_name = article.cafe.clone();
                    target.cafe_url = cafe_url(base, &article.cafe);
                    target
                }
                None => ExtractTarget::from_direct_url(url, None, None, base),
            };

            match extractor.extract(&target).await {
                Extraction::Post(post) => {
                    run.accept(*post, "").await?;
                }
                Extraction::Skipped(reason) => {
                    debug!(url = %url, reason = reason.as_str(), "Direct URL skipped");
                }
            }
            run.progress.publish().await?;
        }
        Ok(())
    }

    async fn refresh_cafes(&self, run: &mut JobRun<'_>) -> JobResult<()> {
        let session = load_session(&self.config, self.pool()).await?;
        let search = SearchClient::new(&self.config, session)?;

        run.progress.update(|p| p.stage = Stage::Search);
        run.progress.publish().await?;

        let cafes = search.fetch_joined_cafes().await?;
        let value = json!({
            "refreshedAt": Utc::now().to_rfc3339(),
            "cafes": cafes,
        });
        upsert_setting(self.pool(), JOINED_CAFES_SETTING_KEY, &value.to_string()).await?;
        run.refreshed = cafes.len();
        info!(cafes = cafes.len(), "Joined cafe list refreshed");
        Ok(())
    }

    async fn write_result_file(&self, job_id: i64, posts: &[ParsedPost]) -> Result<PathBuf> {
        let dir = self.config.results_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("job-{job_id}.json"));
        let document = json!({
            "jobId": job_id,
            "generatedAt": Utc::now().to_rfc3339(),
            "count": posts.len(),
            "posts": posts,
        });
        let body = serde_json::to_vec_pretty(&document).context("Failed to encode results")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// What happened to an extracted post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Persisted,
    Deferred,
    Filtered,
}

/// Mutable state of one job run.
struct JobRun<'a> {
    pool: &'a SqlitePool,
    job_id: i64,
    plan: FilterPlan,
    progress: ProgressChannel,
    sink: SinkBuffer,
    cell_limit: usize,
    deferred: Vec<ParsedPost>,
    persisted: Vec<ParsedPost>,
    inserted: usize,
    refreshed: usize,
}

impl<'a> JobRun<'a> {
    fn new(
        config: &Config,
        pool: &'a SqlitePool,
        job: &ScrapeJob,
        progress: ProgressChannel,
        sink: Option<Arc<dyn RowSink>>,
    ) -> Self {
        Self {
            pool,
            job_id: job.id,
            plan: FilterPlan::from_job(job),
            progress,
            sink: SinkBuffer::new(sink, config.sheet_batch_size, config.sink_timeout),
            cell_limit: config.sheet_cell_limit,
            deferred: Vec::new(),
            persisted: Vec::new(),
            inserted: 0,
            refreshed: 0,
        }
    }

    /// Streaming runs stop once `max_posts` posts are accepted.
    fn is_full(&self) -> bool {
        !self.plan.needs_batch() && self.persisted.len() >= self.plan.max_posts
    }

    fn result_count(&self) -> usize {
        self.persisted.len().max(self.refreshed)
    }

    async fn accept(&mut self, post: ParsedPost, subject: &str) -> Result<Verdict> {
        if !self.plan.accepts_words(subject, &post) {
            debug!(url = %post.source_url, "Rejected by word filter");
            return Ok(Verdict::Filtered);
        }
        if self.plan.needs_batch() {
            self.deferred.push(post);
            return Ok(Verdict::Deferred);
        }
        if !self.plan.thresholds(&[]).passes(&post) {
            debug!(url = %post.source_url, "Below count minimums");
            return Ok(Verdict::Filtered);
        }
        self.persist(post).await?;
        Ok(Verdict::Persisted)
    }

    async fn persist(&mut self, post: ParsedPost) -> Result<()> {
        if self.persisted.len() >= self.plan.max_posts {
            return Ok(());
        }

        if is_duplicate_post(self.pool, &post.source_url, &post.content_hash).await? {
            debug!(url = %post.source_url, "Duplicate content, not stored again");
        } else if insert_post(self.pool, self.job_id, &post).await?.is_some() {
            self.inserted += 1;
        }

        if self.sink.push(SheetRow::from_post(self.job_id, &post, self.cell_limit)) {
            self.sink.flush().await;
        }
        self.persisted.push(post);

        let (collected, db_synced, sheet_synced) =
            (self.persisted.len(), self.inserted, self.sink.delivered());
        self.progress.update(|p| {
            p.collected = collected;
            p.db_synced = db_synced;
            p.sheet_synced = sheet_synced;
        });
        Ok(())
    }

    /// Clamp and persist deferred posts, then force the final sink flush.
    async fn wrap_up(&mut self) -> Result<()> {
        if !self.deferred.is_empty() {
            let batch = std::mem::take(&mut self.deferred);
            let before = batch.len();
            let kept = self.plan.finalize(batch);
            debug!(job_id = self.job_id, before, kept = kept.len(), "Applied batch thresholds");
            for post in kept {
                self.persist(post).await?;
            }
        }

        self.sink.close().await;
        let sheet_synced = self.sink.delivered();
        self.progress.update(|p| p.sheet_synced = sheet_synced);
        Ok(())
    }
}

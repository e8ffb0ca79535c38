//! Candidate discovery through the cafe search API.
//!
//! The collector turns a (cafe, keyword) pair into a bounded, newest-first
//! list of [`ArticleCandidate`]s. It never renders pages except as a last
//! resort for resolving a cafe slug to its numeric id.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::PageDriver;
use crate::config::Config;
use crate::constants::BROWSER_USER_AGENT;
use crate::extractor::metadata::{kst_day_end, kst_day_start, parse_date, parse_list_date, strip_markup, Counts};
use crate::pacing::Pacing;
use crate::session::StorageState;

/// Safety bound on pages requested for one keyword.
const MAX_PAGES_PER_KEYWORD: usize = 40;

static EMBEDDED_CAFE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:clubid=|"cafeId"\s*:\s*"?|g_sClubId\s*=\s*"|cafeId=)(\d+)"#).unwrap()
});

static LEGACY_ARTICLE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[?&]clubid=(\d+).*?[?&]articleid=(\d+)|[?&]articleid=(\d+).*?[?&]clubid=(\d+)").unwrap()
});

static MODERN_ARTICLE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/ca-fe/(?:web/)?cafes/([^/?#]+)/articles/(\d+)").unwrap());

static SLUG_ARTICLE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/([A-Za-z0-9_-]+)/(\d+)/?$").unwrap());

/// A search-result reference to a post, not yet content-verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleCandidate {
    pub article_id: u64,
    pub cafe_id: String,
    pub url: String,
    pub subject: String,
    pub read_count: i64,
    pub like_count: i64,
    pub comment_count: i64,
    pub board_type: String,
    pub board_name: String,
    pub added_at: Option<DateTime<Utc>>,
    pub keyword: String,
}

impl ArticleCandidate {
    #[must_use]
    pub fn list_counts(&self) -> Counts {
        Counts {
            views: self.read_count,
            likes: self.like_count,
            comments: self.comment_count,
        }
    }
}

/// Cafe and article identifiers parsed from an article URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleRef {
    /// Numeric id or URL slug.
    pub cafe: String,
    pub article_id: u64,
}

/// Parse the legacy, modern and slug article URL forms.
#[must_use]
pub fn parse_article_ref(url: &str) -> Option<ArticleRef> {
    let parsed = url::Url::parse(url).ok()?;

    if let Some(caps) = LEGACY_ARTICLE_URL.captures(url) {
        let (cafe, article) = match (caps.get(1), caps.get(2)) {
            (Some(c), Some(a)) => (c, a),
            _ => (caps.get(4)?, caps.get(3)?),
        };
        return Some(ArticleRef {
            cafe: cafe.as_str().to_string(),
            article_id: article.as_str().parse().ok()?,
        });
    }

    let path = parsed.path();
    if let Some(caps) = MODERN_ARTICLE_PATH.captures(path) {
        return Some(ArticleRef {
            cafe: caps[1].to_string(),
            article_id: caps[2].parse().ok()?,
        });
    }
    if let Some(caps) = SLUG_ARTICLE_PATH.captures(path) {
        return Some(ArticleRef {
            cafe: caps[1].to_string(),
            article_id: caps[2].parse().ok()?,
        });
    }
    None
}

/// Canonical article URL used as `sourceUrl`.
#[must_use]
pub fn canonical_article_url(cafe_base_url: &str, cafe_id: &str, article_id: u64) -> String {
    format!("{cafe_base_url}/ArticleRead.nhn?clubid={cafe_id}&articleid={article_id}")
}

/// Whether an id is already a numeric site-internal id.
#[must_use]
pub fn is_numeric_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

/// Inclusive added-at window derived from a job's date range (KST days).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateWindow {
    /// Build from `YYYY-MM-DD` bounds. Unparsable bounds are ignored.
    #[must_use]
    pub fn from_bounds(from_date: Option<&str>, to_date: Option<&str>) -> Self {
        Self {
            from: from_date.and_then(parse_date).map(kst_day_start),
            to: to_date.and_then(parse_date).map(kst_day_end),
        }
    }

    /// Candidates with an unknown date are kept.
    #[must_use]
    pub fn contains(&self, at: Option<DateTime<Utc>>) -> bool {
        let Some(at) = at else { return true };
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }

    #[must_use]
    pub fn is_before_start(&self, at: Option<DateTime<Utc>>) -> bool {
        matches!((self.from, at), (Some(from), Some(at)) if at < from)
    }
}

/// Candidate take per keyword: `floor(max_urls / keyword_count)`, at least 1.
///
/// `max_urls` is the post cap for the cafe, not the widened [`cafe_budget`].
#[must_use]
pub fn per_keyword_take(max_urls: usize, keyword_count: usize) -> usize {
    if keyword_count == 0 {
        return max_urls.max(1);
    }
    (max_urls / keyword_count).max(1)
}

/// Cap on merged candidates for one cafe across all of its keywords.
#[must_use]
pub fn cafe_budget(max_posts: usize, multiplier: usize) -> usize {
    max_posts.saturating_mul(multiplier.max(1)).max(1)
}

fn normalize_board_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether a candidate's board type or name matches an excluded token.
#[must_use]
pub fn is_board_excluded(board_type: &str, board_name: &str, excluded: &[String]) -> bool {
    let fields = [normalize_board_token(board_type), normalize_board_token(board_name)];
    excluded
        .iter()
        .map(|token| normalize_board_token(token))
        .filter(|token| !token.is_empty())
        .any(|token| {
            fields
                .iter()
                .any(|field| !field.is_empty() && (field == &token || field.contains(&token)))
        })
}

/// Merge per-keyword lists: first occurrence wins, newest first, truncated to `budget`.
#[must_use]
pub fn merge_candidates(lists: Vec<Vec<ArticleCandidate>>, budget: usize) -> Vec<ArticleCandidate> {
    let mut seen = HashSet::new();
    let mut merged: Vec<ArticleCandidate> = lists
        .into_iter()
        .flatten()
        .filter(|c| seen.insert(c.article_id))
        .collect();
    // Stable sort keeps keyword order among equal timestamps.
    merged.sort_by(|a, b| b.added_at.cmp(&a.added_at));
    merged.truncate(budget);
    merged
}

/// One keyword search against one cafe.
#[derive(Debug, Clone)]
pub struct SearchQuery<'a> {
    pub cafe_id: &'a str,
    pub keyword: &'a str,
    pub budget: usize,
    pub exclude_boards: &'a [String],
    pub window: DateWindow,
}

/// Result of one keyword search.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub candidates: Vec<ArticleCandidate>,
    pub pages_scanned: usize,
    pub excluded: usize,
    pub out_of_range: usize,
}

/// A cafe the session user has joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedCafe {
    pub cafe_id: String,
    pub cafe_url: String,
    pub cafe_name: String,
}

/// HTTP client for the cafe search and article APIs.
pub struct SearchClient {
    http: reqwest::Client,
    session: StorageState,
    cafe_base_url: String,
    api_base_url: String,
    page_size: usize,
    pacing: Pacing,
    resolved_ids: Mutex<HashMap<String, String>>,
}

impl SearchClient {
    /// Build a client carrying the session's cookies.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config, session: StorageState) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{}/", config.cafe_base_url))
                .context("Invalid cafe base URL for referer")?,
        );

        let http = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .timeout(config.http_timeout)
            .gzip(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            session,
            cafe_base_url: config.cafe_base_url.clone(),
            api_base_url: config.api_base_url.clone(),
            page_size: config.search_page_size,
            pacing: Pacing::from_config(config),
            resolved_ids: Mutex::new(HashMap::new()),
        })
    }

    async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String> {
        let mut request = self.http.get(url).query(query);
        if let Some(cookie) = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().and_then(|host| self.session.cookie_header(host)))
        {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?;
        if !response.status().is_success() {
            anyhow::bail!("{url} returned HTTP {}", response.status());
        }
        response
            .text()
            .await
            .with_context(|| format!("Failed to read response from {url}"))
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let body = self.get_text(url, query).await?;
        serde_json::from_str(&body).with_context(|| format!("Invalid JSON from {url}"))
    }

    /// Resolve a cafe id or slug to its numeric id.
    ///
    /// Numeric ids pass through. Slugs are resolved from the cafe's landing
    /// page and cached; the browser is used only when that request fails.
    ///
    /// # Errors
    ///
    /// Returns an error if neither path finds an embedded numeric id.
    pub async fn resolve_cafe_id(&self, id: &str, driver: Option<&dyn PageDriver>) -> Result<String> {
        let id = id.trim();
        if is_numeric_id(id) {
            return Ok(id.to_string());
        }
        if let Some(cached) = self.resolved_ids.lock().await.get(id) {
            return Ok(cached.clone());
        }

        let landing = format!("{}/{}", self.cafe_base_url, urlencoding::encode(id));
        let resolved = match self.get_text(&landing, &[]).await {
            Ok(body) => find_embedded_cafe_id(&body),
            Err(e) => {
                debug!(cafe = %id, "Lightweight cafe id lookup failed: {e:#}");
                None
            }
        };

        let resolved = match (resolved, driver) {
            (Some(found), _) => found,
            (None, Some(driver)) => {
                info!(cafe = %id, "Resolving cafe id through the browser");
                driver
                    .goto(&landing)
                    .await
                    .with_context(|| format!("Failed to open cafe page {landing}"))?;
                let html = driver.html().await.context("Failed to read cafe page")?;
                find_embedded_cafe_id(&html)
                    .with_context(|| format!("No cafe id found on {landing}"))?
            }
            (None, None) => anyhow::bail!("No cafe id found for `{id}`"),
        };

        self.resolved_ids
            .lock()
            .await
            .insert(id.to_string(), resolved.clone());
        debug!(cafe = %id, cafe_id = %resolved, "Resolved cafe id");
        Ok(resolved)
    }

    fn search_url(&self) -> String {
        format!(
            "{}/cafe-web/cafe-mobile/CafeMobileWebArticleSearchListV4",
            self.api_base_url
        )
    }

    /// Search one cafe for one keyword, newest first.
    ///
    /// Pages are requested sequentially until a short page, the budget, or a
    /// page entirely older than the window start.
    ///
    /// # Errors
    ///
    /// Returns an error if a page request fails or returns an unexpected shape.
    pub async fn search_keyword(&self, query: &SearchQuery<'_>) -> Result<SearchOutcome> {
        let mut outcome = SearchOutcome::default();
        let mut seen = HashSet::new();
        let budget = query.budget.max(1);

        for page in 1..=MAX_PAGES_PER_KEYWORD {
            if page > 1 {
                self.pacing.pause().await;
            }
            let body = self
                .get_json(
                    &self.search_url(),
                    &[
                        ("cafeId", query.cafe_id.to_string()),
                        ("query", query.keyword.to_string()),
                        ("searchBy", "1".to_string()),
                        ("sortBy", "date".to_string()),
                        ("page", page.to_string()),
                        ("perPage", self.page_size.to_string()),
                    ],
                )
                .await
                .with_context(|| format!("Search page {page} for `{}` failed", query.keyword))?;
            outcome.pages_scanned = page;

            let rows = search_rows(&body);
            let row_count = rows.len();
            let mut all_older = row_count > 0;

            for row in rows {
                let Some(candidate) = candidate_from_row(row, query, &self.cafe_base_url) else {
                    continue;
                };
                if !query.window.is_before_start(candidate.added_at) {
                    all_older = false;
                }
                if !seen.insert(candidate.article_id) {
                    continue;
                }
                if is_board_excluded(&candidate.board_type, &candidate.board_name, query.exclude_boards) {
                    debug!(article_id = candidate.article_id, board = %candidate.board_name, "Excluded board");
                    outcome.excluded += 1;
                    continue;
                }
                if !query.window.contains(candidate.added_at) {
                    outcome.out_of_range += 1;
                    continue;
                }
                outcome.candidates.push(candidate);
                if outcome.candidates.len() >= budget {
                    break;
                }
            }

            if outcome.candidates.len() >= budget || row_count < self.page_size || all_older {
                break;
            }
        }

        outcome
            .candidates
            .sort_by(|a, b| b.added_at.cmp(&a.added_at));
        outcome.candidates.truncate(budget);

        debug!(
            cafe_id = %query.cafe_id,
            keyword = %query.keyword,
            pages = outcome.pages_scanned,
            candidates = outcome.candidates.len(),
            excluded = outcome.excluded,
            "Keyword search complete"
        );
        Ok(outcome)
    }

    /// Counts from the article-detail API, used when page text yields none.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn fetch_article_counts(&self, cafe_id: &str, article_id: u64) -> Result<Counts> {
        let url = format!(
            "{}/cafe-web/cafe-articleapi/v2.1/cafes/{cafe_id}/articles/{article_id}",
            self.api_base_url
        );
        let body = self.get_json(&url, &[]).await?;
        let article = body
            .pointer("/result/article")
            .or_else(|| body.pointer("/message/result/article"))
            .unwrap_or(&Value::Null);
        Ok(Counts {
            views: json_i64(article, &["readCount"]),
            likes: json_i64(article, &["likeItCount", "likeCount"]),
            comments: json_i64(article, &["commentCount"]),
        })
    }

    /// List the cafes the session user has joined.
    ///
    /// # Errors
    ///
    /// Returns an error if a page request fails.
    pub async fn fetch_joined_cafes(&self) -> Result<Vec<JoinedCafe>> {
        let url = format!(
            "{}/cafe-web/cafe-mobile/CafeMobileWebJoinedCafeListV2",
            self.api_base_url
        );
        let mut cafes = Vec::new();
        let mut seen = HashSet::new();

        for page in 1..=MAX_PAGES_PER_KEYWORD {
            if page > 1 {
                self.pacing.pause().await;
            }
            let body = self
                .get_json(
                    &url,
                    &[("page", page.to_string()), ("perPage", self.page_size.to_string())],
                )
                .await
                .context("Failed to fetch joined cafes")?;

            let rows = body
                .pointer("/message/result/cafeList")
                .or_else(|| body.pointer("/message/result/cafes"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let row_count = rows.len();

            for row in rows {
                let cafe_id = json_string(&row, &["cafeId", "clubId", "clubid"]);
                if cafe_id.is_empty() || !seen.insert(cafe_id.clone()) {
                    continue;
                }
                cafes.push(JoinedCafe {
                    cafe_url: json_string(&row, &["cafeUrl", "url"]),
                    cafe_name: strip_markup(&json_string(&row, &["cafeName", "name"])),
                    cafe_id,
                });
            }

            if row_count < self.page_size {
                break;
            }
        }

        if cafes.is_empty() {
            warn!("Joined cafe list came back empty");
        }
        Ok(cafes)
    }
}

/// Find an embedded numeric cafe id in page source.
#[must_use]
pub fn find_embedded_cafe_id(html: &str) -> Option<String> {
    EMBEDDED_CAFE_ID
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn search_rows(body: &Value) -> Vec<&Value> {
    body.pointer("/message/result/articleList")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter(|row| {
                    row.get("type")
                        .and_then(Value::as_str)
                        .map_or(true, |t| t.eq_ignore_ascii_case("ARTICLE"))
                })
                .map(|row| row.get("item").unwrap_or(row))
                .collect()
        })
        .unwrap_or_default()
}

fn json_i64(value: &Value, keys: &[&str]) -> i64 {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.replace(',', "").parse().ok())))
        .unwrap_or(0)
}

fn json_string(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

fn candidate_from_row(item: &Value, query: &SearchQuery<'_>, cafe_base_url: &str) -> Option<ArticleCandidate> {
    let article_id = u64::try_from(json_i64(item, &["articleId", "articleid"])).ok()?;
    if article_id == 0 {
        return None;
    }
    Some(ArticleCandidate {
        article_id,
        cafe_id: query.cafe_id.to_string(),
        url: canonical_article_url(cafe_base_url, query.cafe_id, article_id),
        subject: strip_markup(&json_string(item, &["subject", "title"])),
        read_count: json_i64(item, &["readCount"]),
        like_count: json_i64(item, &["likeItCount", "likeCount"]),
        comment_count: json_i64(item, &["commentCount"]),
        board_type: json_string(item, &["boardType"]),
        board_name: json_string(item, &["menuName", "boardName"]),
        added_at: item.get("addDate").and_then(parse_list_date),
        keyword: query.keyword.to_string(),
    })
}

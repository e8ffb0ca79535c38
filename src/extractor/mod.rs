//! Content extraction: render a candidate and turn it into a [`ParsedPost`].
//!
//! Inaccessible content is not an error here. Every expected failure (an
//! access wall, an empty page, a deleted post, a timeout, a relevance miss)
//! comes back as [`Extraction::Skipped`] with a [`SkipReason`].

pub mod classify;
pub mod comments;
pub mod metadata;
pub mod strategies;

use chrono::{DateTime, Utc};
use scraper::Html;
use tracing::debug;

use crate::browser::PageDriver;
use crate::collector::{canonical_article_url, is_numeric_id, ArticleCandidate, SearchClient};
use crate::config::Config;
use crate::db::ParsedPost;
use crate::filter::{compose_content, contains_normalized, content_hash};
use crate::pacing::Pacing;

use self::classify::{is_access_wall, is_missing_post};
use self::metadata::{counts_from_text, extract_author, extract_title, parse_kst_timestamp, resolve_title, Counts};
use self::strategies::{element_text, select_body, select_comments, BodyMatch, BODY_RULES};

/// Bodies at least this long are never treated as a "missing post" notice.
const MISSING_NOTICE_MAX_CHARS: usize = 300;

/// Why a candidate produced no post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Join wall or permission wall.
    AccessDenied,
    /// Deleted or nonexistent article.
    NotFound,
    /// No selector yielded acceptable text on any URL variant.
    Empty,
    /// The originating keyword is absent from the extracted text.
    RelevanceMiss,
    /// Navigation or a DOM read timed out.
    Timeout,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDenied => "access_denied",
            Self::NotFound => "not_found",
            Self::Empty => "empty",
            Self::RelevanceMiss => "relevance_miss",
            Self::Timeout => "timeout",
        }
    }
}

/// Result of extracting one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Post(Box<ParsedPost>),
    Skipped(SkipReason),
}

/// What to extract and the context it came from.
#[derive(Debug, Clone, Default)]
pub struct ExtractTarget {
    /// Numeric id when known, otherwise the slug.
    pub cafe_id: String,
    pub cafe_name: String,
    pub cafe_url: String,
    pub article_id: Option<u64>,
    pub source_url: String,
    /// Keyword the candidate was found by; direct URLs have none.
    pub keyword: Option<String>,
    pub subject: Option<String>,
    pub list_counts: Option<Counts>,
}

/// Public URL of a cafe.
#[must_use]
pub fn cafe_url(cafe_base_url: &str, cafe: &str) -> String {
    if is_numeric_id(cafe) {
        format!("{cafe_base_url}/ca-fe/cafes/{cafe}")
    } else {
        format!("{cafe_base_url}/{cafe}")
    }
}

impl ExtractTarget {
    #[must_use]
    pub fn from_candidate(candidate: &ArticleCandidate, cafe_name: &str, cafe_url: &str) -> Self {
        Self {
            cafe_id: candidate.cafe_id.clone(),
            cafe_name: cafe_name.to_string(),
            cafe_url: cafe_url.to_string(),
            article_id: Some(candidate.article_id),
            source_url: candidate.url.clone(),
            keyword: Some(candidate.keyword.clone()),
            subject: Some(candidate.subject.clone()).filter(|s| !s.is_empty()),
            list_counts: Some(candidate.list_counts()),
        }
    }

    /// A direct URL; `cafe` and `article_id` come from parsing it, when possible.
    #[must_use]
    pub fn from_direct_url(url: &str, cafe: Option<&str>, article_id: Option<u64>, cafe_base_url: &str) -> Self {
        let source_url = match (cafe, article_id) {
            (Some(cafe), Some(article)) if is_numeric_id(cafe) => {
                canonical_article_url(cafe_base_url, cafe, article)
            }
            _ => url.to_string(),
        };
        Self {
            cafe_id: cafe.unwrap_or_default().to_string(),
            cafe_name: cafe.unwrap_or_default().to_string(),
            cafe_url: cafe.map(|c| cafe_url(cafe_base_url, c)).unwrap_or_default(),
            article_id,
            source_url,
            keyword: None,
            subject: None,
            list_counts: None,
        }
    }
}

/// A parsed rendering of one page.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub body: Option<BodyMatch>,
    pub comments: Vec<String>,
    pub page_text: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub counts: Counts,
}

impl PageSnapshot {
    #[must_use]
    pub fn body_text(&self) -> &str {
        self.body.as_ref().map_or("", |b| b.text.as_str())
    }

    #[must_use]
    pub fn comments_text(&self) -> String {
        self.comments.join("\n\n")
    }

    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.body_text().trim().is_empty() || !self.comments.is_empty()
    }
}

/// Parse rendered HTML into a snapshot.
#[must_use]
pub fn analyze_page(html: &str, max_comments: usize) -> PageSnapshot {
    let doc = Html::parse_document(html);
    let page_text = element_text(doc.root_element());
    PageSnapshot {
        body: select_body(&doc, &BODY_RULES),
        comments: select_comments(&doc, max_comments),
        title: extract_title(&doc),
        author: extract_author(&doc),
        published_at: parse_kst_timestamp(&page_text),
        counts: counts_from_text(&page_text),
        page_text,
    }
}

/// Validity gate for one snapshot.
pub fn validate(snapshot: &PageSnapshot) -> Result<(), SkipReason> {
    let body = snapshot.body_text();
    if body.chars().count() < MISSING_NOTICE_MAX_CHARS
        && (is_missing_post(body) || (body.is_empty() && is_missing_post(&snapshot.page_text)))
    {
        return Err(SkipReason::NotFound);
    }
    if !snapshot.has_content() {
        return Err(if is_access_wall(&snapshot.page_text) {
            SkipReason::AccessDenied
        } else {
            SkipReason::Empty
        });
    }
    let combined = compose_content(body, &snapshot.comments_text());
    if is_access_wall(&combined) {
        return Err(SkipReason::AccessDenied);
    }
    if snapshot.body.as_ref().is_some_and(|b| b.listing) && snapshot.comments.is_empty() {
        return Err(SkipReason::Empty);
    }
    Ok(())
}

/// Drives one page through URL variants and extraction gates.
pub struct ContentExtractor<'a> {
    driver: &'a dyn PageDriver,
    search: &'a SearchClient,
    pacing: Pacing,
    cafe_base_url: &'a str,
    mobile_cafe_base_url: &'a str,
    max_comments: usize,
    max_comment_expansions: usize,
    store_raw_html: bool,
}

impl<'a> ContentExtractor<'a> {
    #[must_use]
    pub fn new(config: &'a Config, driver: &'a dyn PageDriver, search: &'a SearchClient) -> Self {
        Self {
            driver,
            search,
            pacing: Pacing::from_config(config),
            cafe_base_url: &config.cafe_base_url,
            mobile_cafe_base_url: &config.mobile_cafe_base_url,
            max_comments: config.max_comments,
            max_comment_expansions: config.max_comment_expansions,
            store_raw_html: config.store_raw_html,
        }
    }

    /// URL forms to try, simplest rendering first.
    #[must_use]
    pub fn url_variants(&self, target: &ExtractTarget) -> Vec<String> {
        let Some(article) = target.article_id else {
            return vec![target.source_url.clone()];
        };
        let cafe = target.cafe_id.as_str();
        if is_numeric_id(cafe) {
            vec![
                format!("{}/ca-fe/cafes/{cafe}/articles/{article}", self.cafe_base_url),
                canonical_article_url(self.cafe_base_url, cafe, article),
                format!("{}/ca-fe/web/cafes/{cafe}/articles/{article}", self.mobile_cafe_base_url),
            ]
        } else if !cafe.is_empty() {
            vec![
                format!("{}/{cafe}/{article}", self.cafe_base_url),
                format!("{}/ca-fe/web/cafes/{cafe}/articles/{article}", self.mobile_cafe_base_url),
            ]
        } else {
            vec![target.source_url.clone()]
        }
    }

    async fn render(&self, url: &str) -> Result<String, SkipReason> {
        self.pacing.pause().await;
        let reason = |e: crate::browser::DriverError| {
            if e.is_timeout() {
                SkipReason::Timeout
            } else {
                SkipReason::Empty
            }
        };
        if let Err(e) = self.driver.goto(url).await {
            debug!(url = %url, "Navigation failed: {e}");
            return Err(reason(e));
        }
        comments::load_comments(
            self.driver,
            self.max_comment_expansions,
            !self.pacing.next_delay().is_zero(),
        )
        .await;
        self.driver.html().await.map_err(|e| {
            debug!(url = %url, "Reading page failed: {e}");
            reason(e)
        })
    }

    /// Extract one target. Never fails; expected problems become [`Extraction::Skipped`].
    pub async fn extract(&self, target: &ExtractTarget) -> Extraction {
        let mut last_reason = SkipReason::Empty;
        let mut last_non_empty: Option<(String, usize)> = None;
        let mut accepted: Option<(PageSnapshot, String)> = None;

        for url in self.url_variants(target) {
            let html = match self.render(&url).await {
                Ok(html) => html,
                Err(reason) => {
                    last_reason = reason;
                    continue;
                }
            };
            let snapshot = analyze_page(&html, self.max_comments);
            if snapshot.has_content() {
                last_non_empty = Some((url.clone(), snapshot.body_text().chars().count()));
            }
            match validate(&snapshot) {
                Ok(()) => {
                    accepted = Some((snapshot, html));
                    break;
                }
                Err(reason) => {
                    debug!(url = %url, reason = reason.as_str(), "URL variant rejected");
                    last_reason = reason;
                    if reason == SkipReason::NotFound {
                        break;
                    }
                }
            }
        }

        let Some((snapshot, html)) = accepted else {
            if let Some((url, chars)) = last_non_empty {
                debug!(url = %url, body_chars = chars, "Last non-empty extraction was rejected");
            }
            return Extraction::Skipped(last_reason);
        };

        let title = resolve_title(snapshot.title.as_deref(), target.subject.as_deref(), &target.cafe_name);
        let body_text = snapshot.body_text().to_string();
        let comments_text = snapshot.comments_text();
        let content_text = compose_content(&body_text, &comments_text);

        // The title may be the search snippet, which matched by construction.
        if let Some(keyword) = target.keyword.as_deref() {
            if !contains_normalized(&content_text, keyword) {
                debug!(url = %target.source_url, keyword = %keyword, "Keyword not in extracted text");
                return Extraction::Skipped(SkipReason::RelevanceMiss);
            }
        }

        let counts = self.resolve_counts(target, &snapshot).await;

        Extraction::Post(Box::new(ParsedPost {
            source_url: target.source_url.clone(),
            cafe_id: target.cafe_id.clone(),
            cafe_name: target.cafe_name.clone(),
            cafe_url: target.cafe_url.clone(),
            title,
            author: snapshot.author.clone().unwrap_or_default(),
            published_at: snapshot.published_at.map(|t| t.to_rfc3339()),
            view_count: counts.views,
            like_count: counts.likes,
            comment_count: counts.comments,
            content_hash: content_hash(&target.source_url, &content_text),
            body_text,
            comments_text,
            content_text,
            raw_html: self.store_raw_html.then_some(html),
        }))
    }

    /// Page text first, then list-API counts, then the article API, then comment blocks.
    async fn resolve_counts(&self, target: &ExtractTarget, snapshot: &PageSnapshot) -> Counts {
        let mut counts = snapshot.counts;
        if let Some(list) = target.list_counts {
            counts = counts.or(list);
        } else if counts.is_zero() {
            if let Some(article) = target.article_id.filter(|_| is_numeric_id(&target.cafe_id)) {
                match self.search.fetch_article_counts(&target.cafe_id, article).await {
                    Ok(api) => counts = counts.or(api),
                    Err(e) => debug!(article_id = article, "Article count lookup failed: {e:#}"),
                }
            }
        }
        if counts.comments == 0 {
            counts.comments = snapshot.comments.len() as i64;
        }
        counts
    }
}

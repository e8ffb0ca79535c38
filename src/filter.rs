//! Word filters, view/comment thresholds, the post cap and content hashing.

use sha2::{Digest, Sha256};

use crate::db::{ParsedPost, ScrapeJob};

/// Heading placed between body and comments in `content_text`.
const COMMENTS_HEADING: &str = "[댓글]";

/// Lowercase and drop all whitespace.
#[must_use]
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Case- and space-insensitive substring test. An empty needle never matches.
#[must_use]
pub fn contains_normalized(haystack: &str, needle: &str) -> bool {
    let needle = normalize(needle);
    !needle.is_empty() && normalize(haystack).contains(&needle)
}

/// Concatenate body and comments into the text delivered to sinks.
#[must_use]
pub fn compose_content(body: &str, comments: &str) -> String {
    let body = body.trim();
    let comments = comments.trim();
    match (body.is_empty(), comments.is_empty()) {
        (_, true) => body.to_string(),
        (true, false) => format!("{COMMENTS_HEADING}\n{comments}"),
        (false, false) => format!("{body}\n\n{COMMENTS_HEADING}\n{comments}"),
    }
}

/// Hex SHA-256 over `source_url` followed by `content_text`.
#[must_use]
pub fn content_hash(source_url: &str, content_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_url.as_bytes());
    hasher.update(content_text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Include/exclude word lists.
#[derive(Debug, Clone, Default)]
pub struct WordFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl WordFilter {
    #[must_use]
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        let clean = |words: Vec<String>| {
            words
                .into_iter()
                .filter(|w| !normalize(w).is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            include: clean(include),
            exclude: clean(exclude),
        }
    }

    /// Apply both lists to the concatenation of `parts`.
    #[must_use]
    pub fn accepts(&self, parts: &[&str]) -> bool {
        let text = normalize(&parts.join(" "));
        let hit = |word: &String| text.contains(&normalize(word));
        if !self.include.is_empty() && !self.include.iter().any(hit) {
            return false;
        }
        !self.exclude.iter().any(hit)
    }
}

/// Median of a batch. Even-sized batches take the floor of the two middle values' mean.
#[must_use]
pub fn median(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]).div_euclid(2))
    }
}

/// Effective minimums for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thresholds {
    pub min_views: Option<i64>,
    pub min_comments: Option<i64>,
}

impl Thresholds {
    #[must_use]
    pub fn passes(&self, post: &ParsedPost) -> bool {
        self.min_views.map_or(true, |min| post.view_count >= min)
            && self.min_comments.map_or(true, |min| post.comment_count >= min)
    }
}

/// Everything a job asks of the filter stage.
#[derive(Debug, Clone)]
pub struct FilterPlan {
    pub words: WordFilter,
    pub min_views: Option<i64>,
    pub min_comments: Option<i64>,
    pub auto: bool,
    pub max_posts: usize,
}

impl FilterPlan {
    #[must_use]
    pub fn from_job(job: &ScrapeJob) -> Self {
        Self {
            words: WordFilter::new(job.include_words(), job.exclude_words()),
            min_views: job.min_view_count.filter(|v| *v > 0),
            min_comments: job.min_comment_count.filter(|v| *v > 0),
            auto: job.use_auto_filter,
            max_posts: job.max_posts_clamped(),
        }
    }

    /// A batch median is needed, so posts must be collected before any is accepted.
    #[must_use]
    pub fn needs_batch(&self) -> bool {
        self.auto && (self.min_views.is_none() || self.min_comments.is_none())
    }

    /// Word filters over candidate subject, extracted title and content.
    #[must_use]
    pub fn accepts_words(&self, subject: &str, post: &ParsedPost) -> bool {
        self.words.accepts(&[subject, &post.title, &post.content_text])
    }

    /// Thresholds for this run; auto mode fills missing minimums from the batch median.
    #[must_use]
    pub fn thresholds(&self, batch: &[ParsedPost]) -> Thresholds {
        let views: Vec<i64> = batch.iter().map(|p| p.view_count).collect();
        let comments: Vec<i64> = batch.iter().map(|p| p.comment_count).collect();
        Thresholds {
            min_views: self
                .min_views
                .or_else(|| self.auto.then(|| median(&views)).flatten()),
            min_comments: self
                .min_comments
                .or_else(|| self.auto.then(|| median(&comments)).flatten()),
        }
    }

    /// Apply the count clamp to a collected batch, then the post cap. Order is preserved.
    #[must_use]
    pub fn finalize(&self, batch: Vec<ParsedPost>) -> Vec<ParsedPost> {
        let thresholds = self.thresholds(&batch);
        batch
            .into_iter()
            .filter(|p| thresholds.passes(p))
            .take(self.max_posts)
            .collect()
    }
}

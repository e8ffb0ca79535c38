use serde::{Deserialize, Serialize};

/// Lifecycle status of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Scrape,
    RefreshCafes,
}

impl JobType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scrape => "SCRAPE",
            Self::RefreshCafes => "REFRESH_CAFES",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SCRAPE" => Some(Self::Scrape),
            "REFRESH_CAFES" => Some(Self::RefreshCafes),
            _ => None,
        }
    }
}

/// A scrape job row. List-valued columns are stored as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScrapeJob {
    pub id: i64,
    pub job_type: String,
    pub status: String,
    pub keywords: String,
    pub direct_urls: String,
    pub include_words: String,
    pub exclude_words: String,
    pub exclude_boards: String,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub min_view_count: Option<i64>,
    pub min_comment_count: Option<i64>,
    pub use_auto_filter: bool,
    pub max_posts: i64,
    pub cafe_ids: String,
    pub cafe_names: String,
    pub result_count: i64,
    pub sheet_synced: i64,
    pub result_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Execution mode derived from a job's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMode {
    /// Search each target cafe for each keyword.
    Keywords {
        keywords: Vec<String>,
        cafes: Vec<CafeTarget>,
    },
    /// Extract each URL directly.
    DirectUrls(Vec<String>),
}

/// A cafe the job searches, as supplied by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CafeTarget {
    /// Numeric site id or the cafe's URL slug.
    pub id: String,
    pub name: String,
}

impl ScrapeJob {
    #[must_use]
    pub fn status_enum(&self) -> Option<JobStatus> {
        JobStatus::from_str(&self.status)
    }

    #[must_use]
    pub fn job_type_enum(&self) -> Option<JobType> {
        JobType::from_str(&self.job_type)
    }

    #[must_use]
    pub fn keywords(&self) -> Vec<String> {
        parse_list(&self.keywords)
    }

    #[must_use]
    pub fn direct_urls(&self) -> Vec<String> {
        parse_list(&self.direct_urls)
    }

    #[must_use]
    pub fn include_words(&self) -> Vec<String> {
        parse_list(&self.include_words)
    }

    #[must_use]
    pub fn exclude_words(&self) -> Vec<String> {
        parse_list(&self.exclude_words)
    }

    #[must_use]
    pub fn exclude_boards(&self) -> Vec<String> {
        parse_list(&self.exclude_boards)
    }

    /// Target cafes, pairing the parallel id and name arrays.
    ///
    /// A missing name falls back to the id.
    #[must_use]
    pub fn cafe_targets(&self) -> Vec<CafeTarget> {
        let names = parse_list(&self.cafe_names);
        parse_list(&self.cafe_ids)
            .into_iter()
            .enumerate()
            .map(|(i, id)| CafeTarget {
                name: names
                    .get(i)
                    .filter(|n| !n.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| id.clone()),
                id,
            })
            .collect()
    }

    /// Resolve the execution mode. Direct URLs win when both are present.
    #[must_use]
    pub fn mode(&self) -> JobMode {
        let urls = self.direct_urls();
        if !urls.is_empty() {
            return JobMode::DirectUrls(urls);
        }
        JobMode::Keywords {
            keywords: self.keywords(),
            cafes: self.cafe_targets(),
        }
    }

    /// `max_posts` clamped to the supported range.
    #[must_use]
    pub fn max_posts_clamped(&self) -> usize {
        clamp_max_posts(self.max_posts) as usize
    }
}

/// Clamp a requested post cap into `[1, 300]`.
#[must_use]
pub fn clamp_max_posts(value: i64) -> i64 {
    value.clamp(crate::constants::MIN_MAX_POSTS, crate::constants::MAX_MAX_POSTS)
}

fn parse_list(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Data for creating a new job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewScrapeJob {
    pub keywords: Vec<String>,
    pub direct_urls: Vec<String>,
    pub include_words: Vec<String>,
    pub exclude_words: Vec<String>,
    pub exclude_boards: Vec<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub min_view_count: Option<i64>,
    pub min_comment_count: Option<i64>,
    pub use_auto_filter: bool,
    pub max_posts: i64,
    pub cafe_ids: Vec<String>,
    pub cafe_names: Vec<String>,
}

/// A post produced by one successful extraction and filter pass.
///
/// `content_hash` is derived from `source_url` and `content_text` and is the
/// identity used for duplicate suppression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPost {
    pub source_url: String,
    pub cafe_id: String,
    pub cafe_name: String,
    pub cafe_url: String,
    pub title: String,
    pub author: String,
    pub published_at: Option<String>,
    pub view_count: i64,
    pub like_count: i64,
    pub comment_count: i64,
    pub body_text: String,
    pub comments_text: String,
    pub content_text: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_html: Option<String>,
}

/// A post persisted by a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredPost {
    pub id: i64,
    pub job_id: i64,
    pub source_url: String,
    pub cafe_id: String,
    pub cafe_name: String,
    pub cafe_url: String,
    pub title: String,
    pub author: String,
    pub published_at: Option<String>,
    pub view_count: i64,
    pub like_count: i64,
    pub comment_count: i64,
    pub body_text: String,
    pub comments_text: String,
    pub content_text: String,
    pub content_hash: String,
    pub raw_html: Option<String>,
    pub created_at: String,
}

/// A key/value settings row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

//! Title, author, timestamp and count derivation from article pages.
//!
//! Article pages render times as `YYYY.MM.DD. HH:MM` in Korea Standard Time
//! and counts as `조회 1,234` or `1.2만`. Everything here is a pure function
//! over text or a parsed document.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use scraper::{Html, Selector};

/// Offset of Korea Standard Time from UTC, in hours.
const KST_OFFSET_HOURS: i64 = 9;

static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\.\s*(\d{1,2})\.\s*(\d{1,2})\.?\s+(\d{1,2}):(\d{2})").unwrap()
});

static DATE_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{4})[.\-/]\s*(\d{1,2})[.\-/]\s*(\d{1,2})\.?\s*$").unwrap());

static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

static VIEW_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"조회(?:수)?\s*:?\s*([\d.,]+\s*[만천]?)").unwrap());

static LIKE_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:좋아요|공감)\s*:?\s*([\d.,]+\s*[만천]?)").unwrap());

static COMMENT_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"댓글(?:수)?\s*:?\s*([\d.,]+\s*[만천]?)").unwrap());

static TITLE_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        ".ArticleTitle .title_text",
        "h3.title_text",
        ".title_text",
        ".tit-box .b",
        "h2.tit",
        ".post_title",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

static OG_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());

static DOCUMENT_TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());

static AUTHOR_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        ".ArticleWriterProfile .nickname",
        ".WriterInfo .nickname",
        ".profile_area .nickname",
        ".nick_box .nickname",
        ".p-nick",
        ".user_name",
        ".nick",
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

/// Titles that identify the site rather than the post.
const GENERIC_TITLES: &[&str] = &["네이버 카페", "naver 카페", "naver cafe", "카페", "cafe"];

/// View, like and comment counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
}

impl Counts {
    /// Fill zero fields from `fallback`.
    #[must_use]
    pub fn or(self, fallback: Self) -> Self {
        Self {
            views: if self.views > 0 { self.views } else { fallback.views },
            likes: if self.likes > 0 { self.likes } else { fallback.likes },
            comments: if self.comments > 0 {
                self.comments
            } else {
                fallback.comments
            },
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.views == 0 && self.likes == 0 && self.comments == 0
    }
}

fn kst_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(naive - chrono::Duration::hours(KST_OFFSET_HOURS)))
}

/// Find the first `YYYY.MM.DD. HH:MM` timestamp in `text` and convert it to UTC.
#[must_use]
pub fn parse_kst_timestamp(text: &str) -> Option<DateTime<Utc>> {
    TIMESTAMP.captures_iter(text).find_map(|caps| {
        let num = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
        let date = NaiveDate::from_ymd_opt(num(1)? as i32, num(2)?, num(3)?)?;
        let time = NaiveTime::from_hms_opt(num(4)?, num(5)?, 0)?;
        Some(kst_to_utc(date.and_time(time)))
    })
}

/// Parse a date-only value (`2024-05-01`, `2024.05.01.`) as a calendar date.
#[must_use]
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let caps = DATE_ONLY.captures(text)?;
    let num = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
    NaiveDate::from_ymd_opt(num(1)? as i32, num(2)?, num(3)?)
}

/// Start of a KST calendar day, in UTC.
#[must_use]
pub fn kst_day_start(date: NaiveDate) -> DateTime<Utc> {
    kst_to_utc(date.and_time(NaiveTime::MIN))
}

/// Last second of a KST calendar day, in UTC.
#[must_use]
pub fn kst_day_end(date: NaiveDate) -> DateTime<Utc> {
    let end = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    kst_to_utc(date.and_time(end))
}

/// Parse a search-list `addDate`: epoch milliseconds or a KST timestamp string.
#[must_use]
pub fn parse_list_date(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        serde_json::Value::String(s) => {
            if let Ok(ms) = s.trim().parse::<i64>() {
                return Utc.timestamp_millis_opt(ms).single();
            }
            parse_kst_timestamp(s).or_else(|| parse_date(s).map(kst_day_start))
        }
        _ => None,
    }
}

/// Parse a displayed count: `1,234`, `987`, `1.2만`, `3천`.
#[must_use]
pub fn parse_count(text: &str) -> Option<i64> {
    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    let (digits, multiplier) = if let Some(rest) = compact.strip_suffix('만') {
        (rest, 10_000.0)
    } else if let Some(rest) = compact.strip_suffix('천') {
        (rest, 1_000.0)
    } else {
        (compact.as_str(), 1.0)
    };
    if digits.is_empty() {
        return None;
    }
    if multiplier > 1.0 {
        let value: f64 = digits.parse().ok()?;
        return Some((value * multiplier).round() as i64);
    }
    digits.parse().ok()
}

fn labelled_count(re: &Regex, text: &str) -> i64 {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_count(m.as_str()))
        .unwrap_or(0)
}

/// Counts shown next to their Korean labels in page text.
#[must_use]
pub fn counts_from_text(text: &str) -> Counts {
    Counts {
        views: labelled_count(&VIEW_COUNT, text),
        likes: labelled_count(&LIKE_COUNT, text),
        comments: labelled_count(&COMMENT_COUNT, text),
    }
}

/// Remove search-highlight markup and collapse whitespace.
#[must_use]
pub fn strip_markup(text: &str) -> String {
    let stripped = TAGS.replace_all(text, "");
    let decoded = stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");
    collapse_whitespace(&decoded)
}

/// Join runs of whitespace into single spaces.
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a title names the site rather than the post.
#[must_use]
pub fn is_generic_title(title: &str, cafe_name: &str) -> bool {
    let title = collapse_whitespace(title);
    if title.is_empty() {
        return true;
    }
    let lowered = title.to_lowercase();
    let trimmed_suffix = lowered
        .trim_end_matches(": 네이버 카페")
        .trim_end_matches(": naver 카페")
        .trim();
    GENERIC_TITLES.contains(&lowered.as_str())
        || GENERIC_TITLES.contains(&trimmed_suffix)
        || (!cafe_name.is_empty() && trimmed_suffix == cafe_name.to_lowercase())
}

fn first_text(doc: &Html, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        doc.select(selector)
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .find(|t| !t.is_empty())
    })
}

/// On-page title, falling back to `og:title` and the document title.
#[must_use]
pub fn extract_title(doc: &Html) -> Option<String> {
    first_text(doc, &TITLE_SELECTORS)
        .or_else(|| {
            doc.select(&OG_TITLE)
                .find_map(|el| el.value().attr("content"))
                .map(collapse_whitespace)
                .filter(|t| !t.is_empty())
        })
        .or_else(|| {
            doc.select(&DOCUMENT_TITLE)
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .find(|t| !t.is_empty())
        })
}

/// Post author nickname, when the page shows one.
#[must_use]
pub fn extract_author(doc: &Html) -> Option<String> {
    first_text(doc, &AUTHOR_SELECTORS)
}

/// Choose the page title unless it is generic, in which case use the search snippet.
#[must_use]
pub fn resolve_title(page_title: Option<&str>, snippet: Option<&str>, cafe_name: &str) -> String {
    match page_title {
        Some(title) if !is_generic_title(title, cafe_name) => collapse_whitespace(title),
        _ => snippet
            .map(strip_markup)
            .filter(|s| !s.is_empty())
            .or_else(|| page_title.map(collapse_whitespace))
            .unwrap_or_default(),
    }
}

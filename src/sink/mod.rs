//! Row delivery to the spreadsheet sink and job notifications.
//!
//! Delivery is at-least-once and best-effort: a failed batch is retried once
//! at the next flush and then dropped. The job store keeps the full text
//! regardless of what the sink accepted.

pub mod sheets;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::ParsedPost;

pub use sheets::WebhookSink;
pub use telegram::{notifier_from_config, Notifier, NoopNotifier, TelegramNotifier};

/// Appended to a cell that was cut to fit the sink's per-cell ceiling.
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// One spreadsheet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub job_id: i64,
    pub collected_at: String,
    pub cafe_name: String,
    pub cafe_url: String,
    pub source_url: String,
    pub title: String,
    pub author: String,
    pub published_at: String,
    pub view_count: i64,
    pub like_count: i64,
    pub comment_count: i64,
    pub content_text: String,
}

impl SheetRow {
    /// Build a row with every text cell clamped to `cell_limit` characters.
    #[must_use]
    pub fn from_post(job_id: i64, post: &ParsedPost, cell_limit: usize) -> Self {
        let cell = |text: &str| clamp_cell(text, cell_limit);
        Self {
            job_id,
            collected_at: Utc::now().to_rfc3339(),
            cafe_name: cell(&post.cafe_name),
            cafe_url: cell(&post.cafe_url),
            source_url: cell(&post.source_url),
            title: cell(&post.title),
            author: cell(&post.author),
            published_at: post.published_at.clone().unwrap_or_default(),
            view_count: post.view_count,
            like_count: post.like_count,
            comment_count: post.comment_count,
            content_text: cell(&post.content_text),
        }
    }
}

/// Cut `text` to at most `limit` characters, ending with [`TRUNCATION_MARKER`] when cut.
#[must_use]
pub fn clamp_cell(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if limit <= marker_len {
        return text.chars().take(limit).collect();
    }
    let mut clamped: String = text.chars().take(limit - marker_len).collect();
    clamped.push_str(TRUNCATION_MARKER);
    clamped
}

/// A spreadsheet-shaped destination.
#[async_trait]
pub trait RowSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, rows: &[SheetRow]) -> Result<()>;
}

/// Build the configured row sink, if any.
pub fn sink_from_config(config: &Config) -> Result<Option<Arc<dyn RowSink>>> {
    match config.sheet_webhook_url.as_deref() {
        Some(url) => Ok(Some(Arc::new(WebhookSink::new(url, config.sink_timeout)?))),
        None => Ok(None),
    }
}

/// Batches rows for a sink within one job.
pub struct SinkBuffer {
    sink: Option<Arc<dyn RowSink>>,
    batch_size: usize,
    timeout: Duration,
    pending: Vec<SheetRow>,
    retry: Vec<SheetRow>,
    delivered: usize,
    dropped: usize,
}

impl SinkBuffer {
    #[must_use]
    pub fn new(sink: Option<Arc<dyn RowSink>>, batch_size: usize, timeout: Duration) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            timeout,
            pending: Vec::new(),
            retry: Vec::new(),
            delivered: 0,
            dropped: 0,
        }
    }

    /// Queue a row. Returns `true` when a batch is ready to flush.
    pub fn push(&mut self, row: SheetRow) -> bool {
        if self.sink.is_none() {
            return false;
        }
        self.pending.push(row);
        self.pending.len() >= self.batch_size
    }

    /// Rows confirmed delivered so far.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Rows given up on after their retry failed.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Send queued rows plus any rows awaiting retry. Never fails the job.
    ///
    /// Returns the number of rows delivered by this call.
    pub async fn flush(&mut self) -> usize {
        let Some(sink) = self.sink.clone() else {
            return 0;
        };
        if self.pending.is_empty() && self.retry.is_empty() {
            return 0;
        }

        let retried = std::mem::take(&mut self.retry);
        let fresh = std::mem::take(&mut self.pending);
        let mut batch = Vec::with_capacity(retried.len() + fresh.len());
        batch.extend(retried.iter().cloned());
        batch.extend(fresh.iter().cloned());

        let result = match tokio::time::timeout(self.timeout, sink.send(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "{} sink timed out after {}s",
                sink.name(),
                self.timeout.as_secs()
            )),
        };

        match result {
            Ok(()) => {
                self.delivered += batch.len();
                debug!(sink = sink.name(), rows = batch.len(), "Flushed rows to sink");
                batch.len()
            }
            Err(e) => {
                if !retried.is_empty() {
                    warn!(
                        sink = sink.name(),
                        rows = retried.len(),
                        "Dropping rows after failed retry: {e:#}"
                    );
                    self.dropped += retried.len();
                }
                warn!(sink = sink.name(), rows = fresh.len(), "Sink delivery failed, will retry once: {e:#}");
                self.retry = fresh;
                0
            }
        }
    }

    /// Final flush; rows still failing after this are dropped.
    pub async fn close(&mut self) -> usize {
        let mut sent = self.flush().await;
        if !self.retry.is_empty() {
            sent += self.flush().await;
        }
        if !self.retry.is_empty() {
            self.dropped += self.retry.len();
            warn!(rows = self.retry.len(), "Dropping undeliverable rows at end of job");
            self.retry.clear();
        }
        sent
    }
}

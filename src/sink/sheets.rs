//! Spreadsheet delivery through an Apps Script style webhook.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::{RowSink, SheetRow};

#[derive(Serialize)]
struct Payload<'a> {
    rows: &'a [SheetRow],
}

/// POSTs `{"rows": [...]}` to a webhook URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    /// Create a sink for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RowSink for WebhookSink {
    fn name(&self) -> &'static str {
        "sheet-webhook"
    }

    async fn send(&self, rows: &[SheetRow]) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&Payload { rows })
            .send()
            .await
            .context("Sheet webhook request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Sheet webhook returned {status}: {}",
                body.chars().take(200).collect::<String>()
            );
        }
        Ok(())
    }
}

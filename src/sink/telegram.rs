//! Fire-and-forget job notifications.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;

/// Receives a message when a job finishes. Implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job_id: i64, text: &str);
}

/// Discards notifications.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, job_id: i64, _text: &str) {
        debug!(job_id, "No notifier configured");
    }
}

/// Sends notifications through the Telegram Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    #[must_use]
    pub fn new(api_base_url: &str, bot_token: &str, chat_id: &str, client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: format!("{api_base_url}/bot{bot_token}/sendMessage"),
            chat_id: chat_id.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, job_id: i64, text: &str) {
        let result = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(job_id, "Notification sent");
            }
            Ok(response) => warn!(job_id, status = %response.status(), "Notification rejected"),
            Err(e) => warn!(job_id, "Notification failed: {e}"),
        }
    }
}

/// Telegram when both token and chat id are configured, otherwise a no-op.
#[must_use]
pub fn notifier_from_config(config: &Config) -> Arc<dyn Notifier> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            let client = reqwest::Client::builder()
                .timeout(config.sink_timeout)
                .build()
                .unwrap_or_default();
            Arc::new(TelegramNotifier::new(
                &config.telegram_api_base_url,
                token,
                chat_id,
                client,
            ))
        }
        _ => Arc::new(NoopNotifier),
    }
}

//! Operator notifications. Delivery is best effort: a failed send is logged and never
//! affects the run that triggered it.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::SyncConfig;

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, text: &str);
}

/// Used when no transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlerter;

#[async_trait]
impl AlertSink for NoopAlerter {
    async fn send(&self, text: &str) {
        warn!(text, "alert transport not configured; dropping alert");
    }
}

#[derive(Debug, Clone)]
pub struct TelegramAlerter {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramAlerter {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_api_base(TELEGRAM_API, bot_token, chat_id)
    }

    pub fn with_api_base(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl AlertSink for TelegramAlerter {
    async fn send(&self, text: &str) {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let result = self
            .client
            .post(url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => info!("alert delivered"),
            Err(err) => warn!(error = %err, "alert delivery failed"),
        }
    }
}

/// Telegram when both credentials are set, otherwise the no-op sink.
pub fn alerter_from_config(config: &SyncConfig) -> anyhow::Result<Box<dyn AlertSink>> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat)) => Ok(Box::new(TelegramAlerter::new(token, chat)?)),
        _ => Ok(Box::new(NoopAlerter)),
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct RecordingAlerter {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingAlerter {
        pub async fn sent(&self) -> Vec<String> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlerter {
        async fn send(&self, text: &str) {
            self.sent.lock().await.push(text.to_string());
        }
    }
}

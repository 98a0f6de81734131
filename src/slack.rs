use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SlackConfig;

const SLACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("slack is not configured")]
    NotConfigured,

    #[error("slack request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("slack returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("slack api error: {0}")]
    Api(String),
}

/// Posts operational notices to Slack, through an incoming webhook when one
/// is configured and through `chat.postMessage` with the bot token otherwise.
pub struct SlackNotifier {
    http: reqwest::Client,
    config: SlackConfig,
}

impl SlackNotifier {
    pub fn new(http: reqwest::Client, config: SlackConfig) -> Self {
        Self { http, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.webhook_url.is_some()
            || (self.config.bot_token.is_some() && self.config.channel.is_some())
    }

    pub async fn send(&self, text: &str) -> Result<(), NotifyError> {
        if let Some(webhook_url) = self.config.webhook_url.as_deref() {
            return self.send_webhook(webhook_url, text).await;
        }
        match (
            self.config.bot_token.as_deref(),
            self.config.channel.as_deref(),
        ) {
            (Some(token), Some(channel)) => self.post_message(token, channel, text).await,
            _ => Err(NotifyError::NotConfigured),
        }
    }

    /// Best-effort variant of [`send`](Self::send): failures are logged and
    /// swallowed.
    pub async fn notify(&self, text: &str) -> bool {
        match self.send(text).await {
            Ok(()) => true,
            Err(NotifyError::NotConfigured) => {
                debug!("slack notification skipped, no destination configured");
                false
            }
            Err(err) => {
                warn!(error = %err, "slack notification failed");
                false
            }
        }
    }

    async fn send_webhook(&self, webhook_url: &str, text: &str) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(webhook_url)
            .json(&json!({ "text": text }))
            .timeout(SLACK_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(NotifyError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn post_message(&self, token: &str, channel: &str, text: &str) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(format!(
                "{}/chat.postMessage",
                self.config.api_base.trim_end_matches('/')
            ))
            .bearer_auth(token)
            .json(&json!({ "channel": channel, "text": text }))
            .timeout(SLACK_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body: raw_body,
            });
        }
        let body = serde_json::from_str::<Value>(&raw_body).unwrap_or(Value::Null);
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        Err(NotifyError::Api(
            body.get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string(),
        ))
    }
}

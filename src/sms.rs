//! Outbound SMS: the gateway client, scheduling and the due-message dispatcher.

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::TwilioConfig,
    error::ApiError,
    store::{Store, StoreResult},
    types::{Message, MessageStatus, SuppressionReason},
};

/// Messages fetched per dispatcher run.
pub const DISPATCH_BATCH_LIMIT: i64 = 50;
/// How long a claimed message may stay in `sending` before it is failed.
pub const CLAIM_LEASE_MINUTES: i64 = 10;

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ERROR_CHARS: usize = 300;

static E164: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{7,14}$").ok());

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("sms gateway is not configured")]
    NotConfigured,

    #[error("sms gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("sms gateway rejected the message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("sms gateway response missing message sid")]
    InvalidResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsReceipt {
    pub provider_message_id: String,
    pub status: String,
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<SmsReceipt, SmsError>;
}

/// Twilio Programmable Messaging client.
pub struct TwilioClient {
    http: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioClient {
    pub fn new(http: reqwest::Client, config: TwilioConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl SmsGateway for TwilioClient {
    async fn send_sms(&self, to: &str, body: &str) -> Result<SmsReceipt, SmsError> {
        let (Some(sid), Some(token), Some(from)) = (
            self.config.account_sid.as_deref(),
            self.config.auth_token.as_deref(),
            self.config.from_number.as_deref(),
        ) else {
            return Err(SmsError::NotConfigured);
        };

        let response = self
            .http
            .post(format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                self.config.api_base.trim_end_matches('/'),
                sid
            ))
            .basic_auth(sid, Some(token))
            .form(&[("To", to), ("From", from), ("Body", body)])
            .timeout(GATEWAY_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<Value>(&raw_body).unwrap_or(Value::Null);

        if !status.is_success() {
            let message = parsed
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| raw_body.chars().take(MAX_ERROR_CHARS).collect());
            return Err(SmsError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let provider_message_id = parsed
            .get("sid")
            .and_then(Value::as_str)
            .filter(|sid| !sid.is_empty())
            .ok_or(SmsError::InvalidResponse)?;
        Ok(SmsReceipt {
            provider_message_id: provider_message_id.to_string(),
            status: parsed
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("queued")
                .to_string(),
        })
    }
}

/// Normalizes a phone number to E.164. Ten-digit numbers are treated as
/// North American.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let has_plus = trimmed.starts_with('+');
    let digits = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    let candidate = if !has_plus && digits.len() == 10 {
        format!("+1{digits}")
    } else {
        format!("+{digits}")
    };
    let valid = E164
        .as_ref()
        .is_some_and(|re| re.is_match(&candidate));
    valid.then_some(candidate)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Messages this run claimed and settled.
    pub processed: u32,
    pub sent: u32,
    pub failed: u32,
    /// Due messages another run claimed first.
    pub skipped: u32,
    /// Stale in-flight messages failed before the batch.
    pub expired: u64,
}

/// Sends every due scheduled message once.
///
/// Each message is claimed before anything else happens, so two overlapping
/// runs never hand the same row to the gateway. Suppressed recipients are
/// failed without a gateway call and gateway errors fail the row; nothing is
/// retried.
pub async fn dispatch_due_messages(
    store: &dyn Store,
    gateway: &dyn SmsGateway,
    now: DateTime<Utc>,
) -> StoreResult<DispatchReport> {
    let mut report = DispatchReport {
        expired: store
            .expire_stale_claims(now - ChronoDuration::minutes(CLAIM_LEASE_MINUTES))
            .await?,
        ..DispatchReport::default()
    };
    if report.expired > 0 {
        warn!(count = report.expired, "failed stale in-flight sms messages");
    }

    let due = store.due_scheduled_messages(now, DISPATCH_BATCH_LIMIT).await?;
    debug!(count = due.len(), "due scheduled sms messages");

    for item in due {
        let message_id = item.message.id.as_str();
        match store.claim_message(message_id, now).await {
            Ok(true) => {}
            Ok(false) => {
                report.skipped += 1;
                continue;
            }
            Err(err) => {
                warn!(message_id, error = %err, "could not claim scheduled sms");
                continue;
            }
        }
        report.processed += 1;

        let outcome = match item.suppression() {
            Some(reason) => Err(reason.as_str().to_string()),
            None => match item.contact_phone.as_deref().and_then(normalize_phone) {
                None => Err("invalid_phone".to_string()),
                Some(to) => gateway
                    .send_sms(&to, &item.message.body)
                    .await
                    .map_err(|err| truncate_error(&err.to_string())),
            },
        };

        match outcome {
            Ok(receipt) => {
                report.sent += 1;
                if let Err(err) = store
                    .mark_message_sent(message_id, &receipt.provider_message_id, Utc::now())
                    .await
                {
                    // The row stays in `sending` and the next run fails it as
                    // `lease_expired`; it must be corrected by hand.
                    error!(
                        message_id,
                        provider_message_id = %receipt.provider_message_id,
                        error = %err,
                        "sms delivered but not recorded as sent"
                    );
                }
            }
            Err(reason) => {
                report.failed += 1;
                warn!(message_id, reason = %reason, "scheduled sms failed");
                if let Err(err) = store.mark_message_failed(message_id, &reason).await {
                    warn!(message_id, error = %err, "could not record sms failure");
                }
            }
        }
    }

    info!(
        processed = report.processed,
        sent = report.sent,
        failed = report.failed,
        skipped = report.skipped,
        "scheduled sms dispatch finished"
    );
    Ok(report)
}

fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_CHARS).collect()
}

/// Queues an outbound SMS for a contact of the org.
pub async fn schedule_message(
    store: &dyn Store,
    org_id: &str,
    contact_id: &str,
    body: &str,
    scheduled_for: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Message, ApiError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::bad_request("body is required"));
    }

    let contact = store
        .get_contact(org_id, contact_id)
        .await?
        .ok_or_else(|| ApiError::not_found("contact not found"))?;

    match contact.sms_suppression() {
        Some(SuppressionReason::MissingPhone) => {
            return Err(ApiError::bad_request("contact has no phone number"));
        }
        Some(reason) => return Err(ApiError::PolicyViolation(reason.as_str().to_string())),
        None => {}
    }
    if contact.phone.as_deref().and_then(normalize_phone).is_none() {
        return Err(ApiError::bad_request("contact phone number is invalid"));
    }

    let conversation = store
        .find_or_create_conversation(org_id, &contact.id, "sms", now)
        .await?;
    let message = Message {
        id: Uuid::new_v4().to_string(),
        org_id: org_id.to_string(),
        conversation_id: conversation.id,
        direction: "outbound".to_string(),
        body: body.to_string(),
        status: MessageStatus::Scheduled,
        scheduled_for: Some(scheduled_for.unwrap_or(now)),
        sent_at: None,
        provider_message_id: None,
        error: None,
        claimed_at: None,
        created_at: now,
    };
    store.insert_message(&message).await?;
    Ok(message)
}

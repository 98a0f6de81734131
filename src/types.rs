use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    auth::AuthProviderClient, calendar::CalendarClient, config::AppConfig, slack::SlackNotifier,
    sms::SmsGateway, store::Store, transcription::DeepgramClient,
};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub sms: Arc<dyn SmsGateway>,
    pub transcriber: DeepgramClient,
    pub slack: SlackNotifier,
    pub auth_provider: AuthProviderClient,
    pub calendar: CalendarClient,
    pub config: AppConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Scheduled,
    /// Claimed by a dispatcher run and handed to the gateway.
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Some(MessageStatus::Scheduled),
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionReason {
    MissingPhone,
    NoConsent,
    DoNotContact,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionReason::MissingPhone => "missing_phone",
            SuppressionReason::NoConsent => "no_consent",
            SuppressionReason::DoNotContact => "do_not_contact",
        }
    }
}

/// Returns why an SMS to this recipient must not be sent, if any.
///
/// DNC wins over a missing consent flag so the more specific reason is what
/// ends up on the message row.
pub fn sms_suppression(
    phone: Option<&str>,
    sms_consent: bool,
    do_not_contact: bool,
) -> Option<SuppressionReason> {
    if do_not_contact {
        return Some(SuppressionReason::DoNotContact);
    }
    if !sms_consent {
        return Some(SuppressionReason::NoConsent);
    }
    if phone.map(str::trim).unwrap_or("").is_empty() {
        return Some(SuppressionReason::MissingPhone);
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub sms_consent: bool,
    pub do_not_contact: bool,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn sms_suppression(&self) -> Option<SuppressionReason> {
        sms_suppression(self.phone.as_deref(), self.sms_consent, self.do_not_contact)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub org_id: String,
    pub contact_id: String,
    pub channel: String,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.snoozed_until.map(|until| until <= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub org_id: String,
    pub conversation_id: String,
    pub direction: String,
    pub body: String,
    pub status: MessageStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A due scheduled message joined with its recipient's consent fields.
#[derive(Debug, Clone)]
pub struct DueMessage {
    pub message: Message,
    pub contact_phone: Option<String>,
    pub sms_consent: bool,
    pub do_not_contact: bool,
}

impl DueMessage {
    pub fn suppression(&self) -> Option<SuppressionReason> {
        sms_suppression(
            self.contact_phone.as_deref(),
            self.sms_consent,
            self.do_not_contact,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    pub id: String,
    pub org_id: String,
    pub contact_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: i32,
    pub recording_url: Option<String>,
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrgEmailDailyStats {
    pub org_id: String,
    pub date: NaiveDate,
    pub emails_sent: i64,
    pub emails_opened: i64,
    pub emails_clicked: i64,
    pub emails_bounced: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub id: String,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub event: String,
    pub properties: Value,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub user_id: String,
    pub org_id: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Icp,
    Sop,
    MediaAppearance,
    SessionNote,
    ContentItem,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Icp => "icp",
            RecordKind::Sop => "sop",
            RecordKind::MediaAppearance => "media_appearance",
            RecordKind::SessionNote => "session_note",
            RecordKind::ContentItem => "content_item",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "icp" => Some(RecordKind::Icp),
            "sop" => Some(RecordKind::Sop),
            "media_appearance" => Some(RecordKind::MediaAppearance),
            "session_note" => Some(RecordKind::SessionNote),
            "content_item" => Some(RecordKind::ContentItem),
            _ => None,
        }
    }

    /// Maps the plural URL segment used by the dashboard routes.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment.trim().to_ascii_lowercase().as_str() {
            "icps" => Some(RecordKind::Icp),
            "sops" => Some(RecordKind::Sop),
            "media-appearances" => Some(RecordKind::MediaAppearance),
            "session-notes" => Some(RecordKind::SessionNote),
            "content-calendar" => Some(RecordKind::ContentItem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardRecord {
    pub id: String,
    pub org_id: String,
    pub kind: RecordKind,
    pub title: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgSettings {
    pub org_id: String,
    pub settings: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSmsBody {
    pub contact_id: String,
    pub body: String,
    #[serde(default)]
    pub scheduled_for: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnoozeBody {
    pub conversation_id: String,
    #[serde(default)]
    pub snoozed_until: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordBody {
    pub title: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecordBody {
    pub title: Option<String>,
    pub data: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Deserialize)]
pub struct AuthCallbackQuery {
    pub code: Option<String>,
    pub next: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CalendarCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_prefers_do_not_contact_over_other_reasons() {
        assert_eq!(
            sms_suppression(None, false, true),
            Some(SuppressionReason::DoNotContact)
        );
        assert_eq!(
            sms_suppression(Some("+15550100"), false, false),
            Some(SuppressionReason::NoConsent)
        );
        assert_eq!(
            sms_suppression(Some("   "), true, false),
            Some(SuppressionReason::MissingPhone)
        );
        assert_eq!(sms_suppression(Some("+15550100"), true, false), None);
    }

    #[test]
    fn record_kind_segments_round_trip_to_storage_names() {
        let kind = RecordKind::from_segment("media-appearances").expect("segment");
        assert_eq!(kind, RecordKind::MediaAppearance);
        assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        assert!(RecordKind::from_segment("invoices").is_none());
    }

    #[test]
    fn conversation_visibility_follows_snoozed_until() {
        let now = Utc::now();
        let mut conversation = Conversation {
            id: "c1".to_string(),
            org_id: "o1".to_string(),
            contact_id: "k1".to_string(),
            channel: "sms".to_string(),
            snoozed_until: None,
            last_message_at: None,
            created_at: now,
        };
        assert!(conversation.is_visible_at(now));
        conversation.snoozed_until = Some(now + chrono::Duration::hours(1));
        assert!(!conversation.is_visible_at(now));
        conversation.snoozed_until = Some(now - chrono::Duration::seconds(1));
        assert!(conversation.is_visible_at(now));
    }
}

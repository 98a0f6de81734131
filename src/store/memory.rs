use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Store, StoreError, StoreResult};
use crate::types::{
    CallLog, Contact, Conversation, DashboardRecord, DueMessage, Message, MessageStatus,
    OrgEmailDailyStats, OrgSettings, RecordKind, UsageEvent, UserSession,
};

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, UserSession>,
    memberships: Vec<(String, String, DateTime<Utc>)>,
    contacts: Vec<Contact>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    call_logs: Vec<CallLog>,
    email_configs: BTreeSet<String>,
    daily_stats: Vec<OrgEmailDailyStats>,
    usage_events: Vec<UsageEvent>,
    records: Vec<DashboardRecord>,
    settings: HashMap<String, OrgSettings>,
    fail_usage_inserts: bool,
    fail_mark_sent: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_membership(&self, org_id: &str, user_id: &str, joined_at: DateTime<Utc>) {
        self.tables.lock().await.memberships.push((
            org_id.to_string(),
            user_id.to_string(),
            joined_at,
        ));
    }

    pub async fn add_contact(&self, contact: Contact) {
        self.tables.lock().await.contacts.push(contact);
    }

    pub async fn add_conversation(&self, conversation: Conversation) {
        self.tables.lock().await.conversations.push(conversation);
    }

    pub async fn add_message(&self, message: Message) {
        self.tables.lock().await.messages.push(message);
    }

    pub async fn add_call_log(&self, call_log: CallLog) {
        self.tables.lock().await.call_logs.push(call_log);
    }

    pub async fn add_email_config(&self, org_id: &str) {
        self.tables
            .lock()
            .await
            .email_configs
            .insert(org_id.to_string());
    }

    pub async fn fail_usage_inserts(&self) {
        self.tables.lock().await.fail_usage_inserts = true;
    }

    pub async fn fail_mark_sent(&self) {
        self.tables.lock().await.fail_mark_sent = true;
    }

    pub async fn message(&self, message_id: &str) -> Option<Message> {
        self.tables
            .lock()
            .await
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.tables.lock().await.messages.clone()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.tables.lock().await.conversations.clone()
    }

    pub async fn call_logs(&self) -> Vec<CallLog> {
        self.tables.lock().await.call_logs.clone()
    }

    pub async fn daily_stats(&self) -> Vec<OrgEmailDailyStats> {
        self.tables.lock().await.daily_stats.clone()
    }

    pub async fn usage_events(&self) -> Vec<UsageEvent> {
        self.tables.lock().await.usage_events.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, token_hash: &str, session: &UserSession) -> StoreResult<()> {
        self.tables
            .lock()
            .await
            .sessions
            .insert(token_hash.to_string(), session.clone());
        Ok(())
    }

    async fn session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<UserSession>> {
        Ok(self.tables.lock().await.sessions.get(token_hash).cloned())
    }

    async fn primary_org_for_user(&self, user_id: &str) -> StoreResult<Option<String>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .memberships
            .iter()
            .filter(|(_, user, _)| user == user_id)
            .min_by_key(|(_, _, joined_at)| *joined_at)
            .map(|(org, _, _)| org.clone()))
    }

    async fn get_contact(&self, org_id: &str, contact_id: &str) -> StoreResult<Option<Contact>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .contacts
            .iter()
            .find(|c| c.org_id == org_id && c.id == contact_id)
            .cloned())
    }

    async fn find_or_create_conversation(
        &self,
        org_id: &str,
        contact_id: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .conversations
            .iter()
            .find(|c| c.org_id == org_id && c.contact_id == contact_id && c.channel == channel)
        {
            return Ok(existing.clone());
        }
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            contact_id: contact_id.to_string(),
            channel: channel.to_string(),
            snoozed_until: None,
            last_message_at: None,
            created_at: now,
        };
        tables.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn set_snoozed_until(
        &self,
        org_id: &str,
        conversation_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Conversation>> {
        let mut tables = self.tables.lock().await;
        let Some(conversation) = tables
            .conversations
            .iter_mut()
            .find(|c| c.org_id == org_id && c.id == conversation_id)
        else {
            return Ok(None);
        };
        conversation.snoozed_until = until;
        Ok(Some(conversation.clone()))
    }

    async fn list_inbox(&self, org_id: &str, now: DateTime<Utc>) -> StoreResult<Vec<Conversation>> {
        let tables = self.tables.lock().await;
        let mut visible = tables
            .conversations
            .iter()
            .filter(|c| c.org_id == org_id && c.is_visible_at(now))
            .cloned()
            .collect::<Vec<_>>();
        visible.sort_by(|a, b| {
            let a_at = a.last_message_at.unwrap_or(a.created_at);
            let b_at = b.last_message_at.unwrap_or(b.created_at);
            b_at.cmp(&a_at)
        });
        visible.truncate(200);
        Ok(visible)
    }

    async fn clear_due_snoozes(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        let mut cleared = 0;
        for conversation in tables.conversations.iter_mut() {
            if conversation.snoozed_until.is_some_and(|until| until <= now) {
                conversation.snoozed_until = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        self.tables.lock().await.messages.push(message.clone());
        Ok(())
    }

    async fn due_scheduled_messages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<DueMessage>> {
        let tables = self.tables.lock().await;
        let mut due = tables
            .messages
            .iter()
            .filter(|m| {
                m.status == MessageStatus::Scheduled
                    && m.scheduled_for.is_some_and(|at| at <= now)
            })
            .filter_map(|m| {
                let conversation = tables
                    .conversations
                    .iter()
                    .find(|c| c.id == m.conversation_id)?;
                let contact = tables
                    .contacts
                    .iter()
                    .find(|c| c.id == conversation.contact_id);
                Some(DueMessage {
                    message: m.clone(),
                    contact_phone: contact.and_then(|c| c.phone.clone()),
                    sms_consent: contact.map(|c| c.sms_consent).unwrap_or(false),
                    do_not_contact: contact.map(|c| c.do_not_contact).unwrap_or(false),
                })
            })
            .collect::<Vec<_>>();
        due.sort_by_key(|d| d.message.scheduled_for);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn claim_message(&self, message_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let Some(message) = tables
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.status == MessageStatus::Scheduled)
        else {
            return Ok(false);
        };
        message.status = MessageStatus::Sending;
        message.claimed_at = Some(now);
        Ok(true)
    }

    async fn mark_message_sent(
        &self,
        message_id: &str,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.fail_mark_sent {
            return Err(StoreError::Decode("messages unavailable".to_string()));
        }
        let Some(message) = tables
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.status == MessageStatus::Sending)
        else {
            return Ok(());
        };
        message.status = MessageStatus::Sent;
        message.provider_message_id = Some(provider_message_id.to_string());
        message.sent_at = Some(sent_at);
        message.error = None;
        let conversation_id = message.conversation_id.clone();
        if let Some(conversation) = tables
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.last_message_at = Some(sent_at);
        }
        Ok(())
    }

    async fn mark_message_failed(&self, message_id: &str, reason: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(message) = tables.messages.iter_mut().find(|m| {
            m.id == message_id
                && matches!(m.status, MessageStatus::Scheduled | MessageStatus::Sending)
        }) {
            message.status = MessageStatus::Failed;
            message.error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn expire_stale_claims(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        let mut expired = 0;
        for message in tables.messages.iter_mut() {
            if message.status == MessageStatus::Sending
                && message.claimed_at.is_some_and(|at| at < claimed_before)
            {
                message.status = MessageStatus::Failed;
                message.error = Some("lease_expired".to_string());
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn get_call_log(&self, org_id: &str, call_id: &str) -> StoreResult<Option<CallLog>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .call_logs
            .iter()
            .find(|c| c.org_id == org_id && c.id == call_id)
            .cloned())
    }

    async fn save_transcript(
        &self,
        org_id: &str,
        call_id: &str,
        transcript: &str,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(call) = tables
            .call_logs
            .iter_mut()
            .find(|c| c.org_id == org_id && c.id == call_id)
        {
            call.transcript = Some(transcript.to_string());
        }
        Ok(())
    }

    async fn purge_recordings_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        let mut purged = 0;
        for call in tables.call_logs.iter_mut() {
            if call.recording_url.is_some() && call.started_at < cutoff {
                call.recording_url = None;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn orgs_with_email_config(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .await
            .email_configs
            .iter()
            .cloned()
            .collect())
    }

    async fn ensure_daily_stats(&self, org_id: &str, date: NaiveDate) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        if tables
            .daily_stats
            .iter()
            .any(|row| row.org_id == org_id && row.date == date)
        {
            return Ok(false);
        }
        tables.daily_stats.push(OrgEmailDailyStats {
            org_id: org_id.to_string(),
            date,
            emails_sent: 0,
            emails_opened: 0,
            emails_clicked: 0,
            emails_bounced: 0,
        });
        Ok(true)
    }

    async fn insert_usage_events(&self, events: &[UsageEvent]) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        if tables.fail_usage_inserts {
            return Err(StoreError::Decode("usage_events unavailable".to_string()));
        }
        tables.usage_events.extend(events.iter().cloned());
        Ok(events.len() as u64)
    }

    async fn list_records(
        &self,
        org_id: &str,
        kind: RecordKind,
    ) -> StoreResult<Vec<DashboardRecord>> {
        let tables = self.tables.lock().await;
        let mut records = tables
            .records
            .iter()
            .filter(|r| r.org_id == org_id && r.kind == kind)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn insert_record(&self, record: &DashboardRecord) -> StoreResult<()> {
        self.tables.lock().await.records.push(record.clone());
        Ok(())
    }

    async fn update_record(
        &self,
        org_id: &str,
        kind: RecordKind,
        record_id: &str,
        title: Option<&str>,
        data: Option<&Value>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DashboardRecord>> {
        let mut tables = self.tables.lock().await;
        let Some(record) = tables
            .records
            .iter_mut()
            .find(|r| r.org_id == org_id && r.kind == kind && r.id == record_id)
        else {
            return Ok(None);
        };
        if let Some(title) = title {
            record.title = title.to_string();
        }
        if let Some(data) = data {
            record.data = data.clone();
        }
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn delete_record(
        &self,
        org_id: &str,
        kind: RecordKind,
        record_id: &str,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let before = tables.records.len();
        tables
            .records
            .retain(|r| !(r.org_id == org_id && r.kind == kind && r.id == record_id));
        Ok(tables.records.len() != before)
    }

    async fn get_settings(&self, org_id: &str) -> StoreResult<Option<OrgSettings>> {
        Ok(self.tables.lock().await.settings.get(org_id).cloned())
    }

    async fn save_settings(&self, settings: &OrgSettings) -> StoreResult<()> {
        self.tables
            .lock()
            .await
            .settings
            .insert(settings.org_id.clone(), settings.clone());
        Ok(())
    }
}

//! Persistence for the dashboard backend.
//!
//! Every handler and sweep goes through the [`Store`] trait. Production uses
//! [`PgStore`]; tests use the in-memory implementation, which mirrors the
//! SQL semantics row for row.

#[cfg(test)]
pub mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    CallLog, Contact, Conversation, DashboardRecord, DueMessage, Message, OrgSettings, RecordKind,
    UsageEvent, UserSession,
};

pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("unexpected row: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, token_hash: &str, session: &UserSession) -> StoreResult<()>;

    async fn session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<UserSession>>;

    /// Oldest org membership of the user, if any.
    async fn primary_org_for_user(&self, user_id: &str) -> StoreResult<Option<String>>;

    async fn get_contact(&self, org_id: &str, contact_id: &str) -> StoreResult<Option<Contact>>;

    async fn find_or_create_conversation(
        &self,
        org_id: &str,
        contact_id: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Conversation>;

    /// Sets or clears `snoozed_until`. Returns `None` when the conversation
    /// does not belong to the org.
    async fn set_snoozed_until(
        &self,
        org_id: &str,
        conversation_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Conversation>>;

    async fn list_inbox(&self, org_id: &str, now: DateTime<Utc>) -> StoreResult<Vec<Conversation>>;

    async fn clear_due_snoozes(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn insert_message(&self, message: &Message) -> StoreResult<()>;

    async fn due_scheduled_messages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<DueMessage>>;

    /// Moves a message from `scheduled` to `sending`. `false` means another
    /// run already owns it.
    async fn claim_message(&self, message_id: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn mark_message_sent(
        &self,
        message_id: &str,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn mark_message_failed(&self, message_id: &str, reason: &str) -> StoreResult<()>;

    /// Fails `sending` rows claimed before the cutoff.
    async fn expire_stale_claims(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64>;

    async fn get_call_log(&self, org_id: &str, call_id: &str) -> StoreResult<Option<CallLog>>;

    async fn save_transcript(&self, org_id: &str, call_id: &str, transcript: &str)
        -> StoreResult<()>;

    async fn purge_recordings_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn orgs_with_email_config(&self) -> StoreResult<Vec<String>>;

    /// Inserts the (org, date) stats row unless it exists. `true` when a row
    /// was created.
    async fn ensure_daily_stats(&self, org_id: &str, date: NaiveDate) -> StoreResult<bool>;

    async fn insert_usage_events(&self, events: &[UsageEvent]) -> StoreResult<u64>;

    async fn list_records(&self, org_id: &str, kind: RecordKind)
        -> StoreResult<Vec<DashboardRecord>>;

    async fn insert_record(&self, record: &DashboardRecord) -> StoreResult<()>;

    async fn update_record(
        &self,
        org_id: &str,
        kind: RecordKind,
        record_id: &str,
        title: Option<&str>,
        data: Option<&Value>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DashboardRecord>>;

    async fn delete_record(
        &self,
        org_id: &str,
        kind: RecordKind,
        record_id: &str,
    ) -> StoreResult<bool>;

    async fn get_settings(&self, org_id: &str) -> StoreResult<Option<OrgSettings>>;

    async fn save_settings(&self, settings: &OrgSettings) -> StoreResult<()>;
}

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Postgres, QueryBuilder, Row,
};
use tracing::info;

use super::{Store, StoreError, StoreResult};
use crate::types::{
    CallLog, Contact, Conversation, DashboardRecord, DueMessage, Message, MessageStatus,
    OrgSettings, RecordKind, UsageEvent, UserSession,
};

const CONVERSATION_COLUMNS: &str =
    "id, org_id, contact_id, channel, snoozed_until, last_message_at, created_at";
const RECORD_COLUMNS: &str = "id, org_id, kind, title, data, created_at, updated_at";

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { db })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn contact_from_row(row: &PgRow) -> StoreResult<Contact> {
    Ok(Contact {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        sms_consent: row.try_get("sms_consent")?,
        do_not_contact: row.try_get("do_not_contact")?,
        created_at: row.try_get("created_at")?,
    })
}

fn conversation_from_row(row: &PgRow) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        contact_id: row.try_get("contact_id")?,
        channel: row.try_get("channel")?,
        snoozed_until: row.try_get("snoozed_until")?,
        last_message_at: row.try_get("last_message_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<Message> {
    let status: String = row.try_get("status")?;
    let status = MessageStatus::parse(&status)
        .ok_or_else(|| StoreError::Decode(format!("unknown message status {status:?}")))?;
    Ok(Message {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        conversation_id: row.try_get("conversation_id")?,
        direction: row.try_get("direction")?,
        body: row.try_get("body")?,
        status,
        scheduled_for: row.try_get("scheduled_for")?,
        sent_at: row.try_get("sent_at")?,
        provider_message_id: row.try_get("provider_message_id")?,
        error: row.try_get("error")?,
        claimed_at: row.try_get("claimed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn call_log_from_row(row: &PgRow) -> StoreResult<CallLog> {
    Ok(CallLog {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        contact_id: row.try_get("contact_id")?,
        started_at: row.try_get("started_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        recording_url: row.try_get("recording_url")?,
        transcript: row.try_get("transcript")?,
    })
}

fn record_from_row(row: &PgRow) -> StoreResult<DashboardRecord> {
    let kind: String = row.try_get("kind")?;
    let kind = RecordKind::parse(&kind)
        .ok_or_else(|| StoreError::Decode(format!("unknown record kind {kind:?}")))?;
    Ok(DashboardRecord {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        kind,
        title: row.try_get("title")?,
        data: row.try_get("data")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn create_session(&self, token_hash: &str, session: &UserSession) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO user_sessions (token_hash, user_id, org_id, email, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, now(), $5)",
        )
        .bind(token_hash)
        .bind(&session.user_id)
        .bind(&session.org_id)
        .bind(&session.email)
        .bind(session.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<UserSession>> {
        let row = sqlx::query(
            "SELECT user_id, org_id, email, expires_at FROM user_sessions WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.db)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(UserSession {
            user_id: row.try_get("user_id")?,
            org_id: row.try_get("org_id")?,
            email: row.try_get("email")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    async fn primary_org_for_user(&self, user_id: &str) -> StoreResult<Option<String>> {
        let org_id = sqlx::query_scalar::<_, String>(
            "SELECT org_id FROM org_members WHERE user_id = $1 ORDER BY created_at ASC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(org_id)
    }

    async fn get_contact(&self, org_id: &str, contact_id: &str) -> StoreResult<Option<Contact>> {
        let row = sqlx::query(
            "SELECT id, org_id, name, phone, email, sms_consent, do_not_contact, created_at \
             FROM contacts WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(contact_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn find_or_create_conversation(
        &self,
        org_id: &str,
        contact_id: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        sqlx::query(
            "INSERT INTO conversations (id, org_id, contact_id, channel, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (org_id, contact_id, channel) DO NOTHING",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(contact_id)
        .bind(channel)
        .bind(now)
        .execute(&self.db)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE org_id = $1 AND contact_id = $2 AND channel = $3"
        ))
        .bind(org_id)
        .bind(contact_id)
        .bind(channel)
        .fetch_one(&self.db)
        .await?;
        conversation_from_row(&row)
    }

    async fn set_snoozed_until(
        &self,
        org_id: &str,
        conversation_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET snoozed_until = $3 \
             WHERE org_id = $1 AND id = $2 \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(org_id)
        .bind(conversation_id)
        .bind(until)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn list_inbox(&self, org_id: &str, now: DateTime<Utc>) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE org_id = $1 AND (snoozed_until IS NULL OR snoozed_until <= $2) \
             ORDER BY COALESCE(last_message_at, created_at) DESC \
             LIMIT 200"
        ))
        .bind(org_id)
        .bind(now)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn clear_due_snoozes(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE conversations SET snoozed_until = NULL \
             WHERE snoozed_until IS NOT NULL AND snoozed_until <= $1",
        )
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, org_id, conversation_id, direction, body, status, \
             scheduled_for, sent_at, provider_message_id, error, claimed_at, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(&message.id)
        .bind(&message.org_id)
        .bind(&message.conversation_id)
        .bind(&message.direction)
        .bind(&message.body)
        .bind(message.status.as_str())
        .bind(message.scheduled_for)
        .bind(message.sent_at)
        .bind(&message.provider_message_id)
        .bind(&message.error)
        .bind(message.claimed_at)
        .bind(message.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn due_scheduled_messages(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<DueMessage>> {
        let rows = sqlx::query(
            "SELECT m.id, m.org_id, m.conversation_id, m.direction, m.body, m.status, \
                    m.scheduled_for, m.sent_at, m.provider_message_id, m.error, m.claimed_at, \
                    m.created_at, \
                    c.phone AS contact_phone, \
                    COALESCE(c.sms_consent, FALSE) AS sms_consent, \
                    COALESCE(c.do_not_contact, FALSE) AS do_not_contact \
             FROM messages m \
             JOIN conversations cv ON cv.id = m.conversation_id \
             LEFT JOIN contacts c ON c.id = cv.contact_id \
             WHERE m.status = 'scheduled' AND m.scheduled_for <= $1 \
             ORDER BY m.scheduled_for ASC \
             LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<DueMessage> {
                Ok(DueMessage {
                    message: message_from_row(row)?,
                    contact_phone: row.try_get("contact_phone")?,
                    sms_consent: row.try_get("sms_consent")?,
                    do_not_contact: row.try_get("do_not_contact")?,
                })
            })
            .collect()
    }

    async fn claim_message(&self, message_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'sending', claimed_at = $2 \
             WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(message_id)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_message_sent(
        &self,
        message_id: &str,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "WITH sent AS ( \
                 UPDATE messages \
                 SET status = 'sent', provider_message_id = $2, sent_at = $3, error = NULL \
                 WHERE id = $1 AND status = 'sending' \
                 RETURNING conversation_id \
             ) \
             UPDATE conversations SET last_message_at = $3 \
             WHERE id IN (SELECT conversation_id FROM sent)",
        )
        .bind(message_id)
        .bind(provider_message_id)
        .bind(sent_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_message_failed(&self, message_id: &str, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE messages SET status = 'failed', error = $2 \
             WHERE id = $1 AND status IN ('scheduled', 'sending')",
        )
        .bind(message_id)
        .bind(reason)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn expire_stale_claims(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'failed', error = 'lease_expired' \
             WHERE status = 'sending' AND claimed_at < $1",
        )
        .bind(claimed_before)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_call_log(&self, org_id: &str, call_id: &str) -> StoreResult<Option<CallLog>> {
        let row = sqlx::query(
            "SELECT id, org_id, contact_id, started_at, duration_seconds, recording_url, transcript \
             FROM call_logs WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(call_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(call_log_from_row).transpose()
    }

    async fn save_transcript(
        &self,
        org_id: &str,
        call_id: &str,
        transcript: &str,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE call_logs SET transcript = $3 WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(call_id)
            .bind(transcript)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn purge_recordings_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE call_logs SET recording_url = NULL \
             WHERE recording_url IS NOT NULL AND started_at < $1",
        )
        .bind(cutoff)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn orgs_with_email_config(&self) -> StoreResult<Vec<String>> {
        let orgs = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT org_id FROM email_configs ORDER BY org_id",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(orgs)
    }

    async fn ensure_daily_stats(&self, org_id: &str, date: NaiveDate) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO org_email_daily_stats (org_id, date) VALUES ($1, $2) \
             ON CONFLICT (org_id, date) DO NOTHING",
        )
        .bind(org_id)
        .bind(date)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_usage_events(&self, events: &[UsageEvent]) -> StoreResult<u64> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO usage_events (id, org_id, user_id, event, properties, occurred_at, received_at) ",
        );
        builder.push_values(events, |mut row, event| {
            row.push_bind(event.id.clone())
                .push_bind(event.org_id.clone())
                .push_bind(event.user_id.clone())
                .push_bind(event.event.clone())
                .push_bind(event.properties.clone())
                .push_bind(event.occurred_at)
                .push_bind(event.received_at);
        });
        let result = builder.build().execute(&self.db).await?;
        Ok(result.rows_affected())
    }

    async fn list_records(
        &self,
        org_id: &str,
        kind: RecordKind,
    ) -> StoreResult<Vec<DashboardRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM dashboard_records \
             WHERE org_id = $1 AND kind = $2 ORDER BY created_at DESC"
        ))
        .bind(org_id)
        .bind(kind.as_str())
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn insert_record(&self, record: &DashboardRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO dashboard_records (id, org_id, kind, title, data, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&record.id)
        .bind(&record.org_id)
        .bind(record.kind.as_str())
        .bind(&record.title)
        .bind(&record.data)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.db)
        .await?;
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
        let row = sqlx::query(&format!(
            "UPDATE dashboard_records \
             SET title = COALESCE($4, title), data = COALESCE($5, data), updated_at = $6 \
             WHERE org_id = $1 AND kind = $2 AND id = $3 \
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(org_id)
        .bind(kind.as_str())
        .bind(record_id)
        .bind(title)
        .bind(data.cloned())
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn delete_record(
        &self,
        org_id: &str,
        kind: RecordKind,
        record_id: &str,
    ) -> StoreResult<bool> {
        let result =
            sqlx::query("DELETE FROM dashboard_records WHERE org_id = $1 AND kind = $2 AND id = $3")
                .bind(org_id)
                .bind(kind.as_str())
                .bind(record_id)
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_settings(&self, org_id: &str) -> StoreResult<Option<OrgSettings>> {
        let row =
            sqlx::query("SELECT org_id, settings, updated_at FROM org_settings WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&self.db)
                .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(OrgSettings {
            org_id: row.try_get("org_id")?,
            settings: row.try_get("settings")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_settings(&self, settings: &OrgSettings) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO org_settings (org_id, settings, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (org_id) DO UPDATE \
             SET settings = EXCLUDED.settings, updated_at = EXCLUDED.updated_at",
        )
        .bind(&settings.org_id)
        .bind(&settings.settings)
        .bind(settings.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

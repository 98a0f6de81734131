//! Privileged maintenance sweeps and the telemetry sink.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    store::{Store, StoreResult},
    types::{UsageEvent, UserSession},
};

pub const RECORDING_RETENTION_DAYS: i64 = 90;
pub const USAGE_BATCH_LIMIT: usize = 50;

const MAX_EVENT_NAME_CHARS: usize = 120;

/// Clears every snooze whose deadline has passed.
pub async fn unsnooze_due_conversations(store: &dyn Store, now: DateTime<Utc>) -> StoreResult<u64> {
    let cleared = store.clear_due_snoozes(now).await?;
    info!(cleared, "unsnooze sweep finished");
    Ok(cleared)
}

pub fn recording_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - ChronoDuration::days(RECORDING_RETENTION_DAYS)
}

/// Drops recording URLs of calls older than the retention window.
pub async fn purge_expired_recordings(store: &dyn Store, now: DateTime<Utc>) -> StoreResult<u64> {
    let cutoff = recording_cutoff(now);
    let purged = store.purge_recordings_before(cutoff).await?;
    info!(purged, cutoff = %cutoff, "recording retention sweep finished");
    Ok(purged)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupReport {
    pub date: NaiveDate,
    pub orgs: usize,
    pub created: usize,
}

/// The UTC calendar day before `now`.
pub fn rollup_date(now: DateTime<Utc>) -> NaiveDate {
    (now - ChronoDuration::days(1)).date_naive()
}

/// Makes sure every email-configured org has a stats row for yesterday.
pub async fn rollup_daily_stats(store: &dyn Store, now: DateTime<Utc>) -> StoreResult<RollupReport> {
    let date = rollup_date(now);
    let orgs = store.orgs_with_email_config().await?;
    let mut created = 0;
    for org_id in &orgs {
        if store.ensure_daily_stats(org_id, date).await? {
            created += 1;
        }
    }
    info!(%date, orgs = orgs.len(), created, "daily stats rollup finished");
    Ok(RollupReport {
        date,
        orgs: orgs.len(),
        created,
    })
}

/// Turns a raw telemetry payload into events, keeping at most the first
/// [`USAGE_BATCH_LIMIT`] entries. Accepts `{"events": [...]}` or a bare array;
/// anything unreadable yields no events.
pub fn parse_usage_batch(
    raw: &[u8],
    session: Option<&UserSession>,
    now: DateTime<Utc>,
) -> Vec<UsageEvent> {
    let Ok(payload) = serde_json::from_slice::<Value>(raw) else {
        return Vec::new();
    };
    let entries = match &payload {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("events") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    entries
        .iter()
        .take(USAGE_BATCH_LIMIT)
        .filter_map(|entry| {
            let name = entry
                .get("event")
                .or_else(|| entry.get("name"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())?;
            let occurred_at = entry
                .get("timestamp")
                .or_else(|| entry.get("occurredAt"))
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(now);
            Some(UsageEvent {
                id: Uuid::new_v4().to_string(),
                org_id: session.map(|s| s.org_id.clone()),
                user_id: session.map(|s| s.user_id.clone()),
                event: name.chars().take(MAX_EVENT_NAME_CHARS).collect(),
                properties: entry
                    .get("properties")
                    .filter(|value| value.is_object())
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default())),
                occurred_at,
                received_at: now,
            })
        })
        .collect()
}

/// Persists a telemetry batch. Never fails; returns how many rows landed.
pub async fn ingest_usage_events(store: &dyn Store, events: &[UsageEvent]) -> u64 {
    if events.is_empty() {
        return 0;
    }
    match store.insert_usage_events(events).await {
        Ok(inserted) => inserted,
        Err(err) => {
            warn!(error = %err, count = events.len(), "dropping usage batch");
            0
        }
    }
}

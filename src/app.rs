use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{to_bytes, Body},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, patch, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::{
    auth::{
        code_verifier_from_jar, establish_session, safe_next_path, session_cookie, AuthProviderClient,
        AuthUser, CronAuth, MaybeAuthUser, AUTH_ERROR_PATH,
    },
    calendar::{CalendarClient, CalendarError},
    config::AppConfig,
    error::{ApiError, JsonBody},
    jobs,
    rendering::render_calendar_popup,
    slack::SlackNotifier,
    sms::{self, SmsGateway, TwilioClient},
    store::{PgStore, Store},
    transcription::DeepgramClient,
    types::{
        AppState, AuthCallbackQuery, CalendarCallbackQuery, CreateRecordBody, DashboardRecord,
        OrgSettings, RecordKind, ScheduleSmsBody, SnoozeBody, UpdateRecordBody,
    },
};

const DEFAULT_LOG_FILTER: &str = "info,opsdesk_server=debug";
const DB_MAX_CONNECTIONS: u32 = 10;
/// Usage batches larger than this are read as empty.
const USAGE_BODY_LIMIT: usize = 16 * 1024 * 1024;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp_utc(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn record_kind(segment: &str) -> Result<RecordKind, ApiError> {
    RecordKind::from_segment(segment).ok_or_else(|| ApiError::not_found("unknown record type"))
}

/// Top-level keys in `patch` replace those in `base`; `null` removes a key.
fn merge_settings(base: Value, patch: &Map<String, Value>) -> Value {
    let mut merged = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in patch {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

fn config_warnings(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.cron_secret.is_none() {
        warnings.push("CRON_SECRET is not set; cron endpoints will reject every call");
    }
    if config.calendar.state_secret.is_none() {
        warnings.push(
            "OAUTH_STATE_SECRET is not set; calendar callbacks trust the unsigned org id in state",
        );
    }
    warnings
}

pub fn build_state(
    config: AppConfig,
    store: Arc<dyn Store>,
    sms: Arc<dyn SmsGateway>,
    http: reqwest::Client,
) -> AppState {
    AppState {
        store,
        sms,
        transcriber: DeepgramClient::new(http.clone(), config.deepgram.clone()),
        slack: SlackNotifier::new(http.clone(), config.slack.clone()),
        auth_provider: AuthProviderClient::new(http.clone(), config.auth_provider.clone()),
        calendar: CalendarClient::new(http, config.calendar.clone()),
        config,
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/callback", get(auth_callback))
        .route("/api/calendar/connect", get(calendar_connect))
        .route("/api/calendar/callback", get(calendar_callback))
        .route("/api/sms/schedule", post(schedule_sms))
        .route(
            "/api/cron/send-scheduled-sms",
            get(send_scheduled_sms).post(send_scheduled_sms),
        )
        .route("/api/inbox", get(list_inbox))
        .route("/api/inbox/snooze", post(snooze_conversation))
        .route("/api/cron/unsnooze", get(unsnooze_due).post(unsnooze_due))
        .route(
            "/api/cron/recording-cleanup",
            get(recording_cleanup).post(recording_cleanup),
        )
        .route(
            "/api/cron/daily-stats",
            get(daily_stats_rollup).post(daily_stats_rollup),
        )
        .route("/api/usage/batch", post(usage_batch))
        .route("/api/calls/{call_id}/transcribe", post(transcribe_call))
        .route("/api/records/{kind}", get(list_records).post(create_record))
        .route(
            "/api/records/{kind}/{record_id}",
            patch(update_record).delete(delete_record),
        )
        .route("/api/settings", get(get_settings).patch(update_settings))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn auth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthCallbackQuery>,
    jar: CookieJar,
) -> Response {
    if let Some(error) = query.error.as_deref() {
        warn!(
            error,
            description = query.error_description.as_deref().unwrap_or(""),
            "auth provider returned an error"
        );
        return Redirect::to(AUTH_ERROR_PATH).into_response();
    }
    let Some(code) = query.code.as_deref().filter(|c| !c.trim().is_empty()) else {
        return Redirect::to(AUTH_ERROR_PATH).into_response();
    };

    let verifier = code_verifier_from_jar(&jar);
    let issued = match establish_session(
        state.store.as_ref(),
        &state.auth_provider,
        code.trim(),
        verifier.as_deref(),
        state.config.session_ttl_hours,
        Utc::now(),
    )
    .await
    {
        Ok(issued) => issued,
        Err(err) => {
            warn!(error = %err, "auth code exchange failed");
            return Redirect::to(AUTH_ERROR_PATH).into_response();
        }
    };

    info!(user_id = %issued.session.user_id, org_id = %issued.session.org_id, "user signed in");
    let next = safe_next_path(query.next.as_deref());
    let jar = jar.add(session_cookie(
        issued.token,
        state.config.session_ttl_hours,
        state.config.secure_cookies,
    ));
    (jar, Redirect::to(&next)).into_response()
}

async fn calendar_connect(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
) -> Result<Redirect, ApiError> {
    let url = state
        .calendar
        .connect_url(&session.org_id, Utc::now())
        .map_err(|err| match err {
            CalendarError::NotConfigured => {
                ApiError::bad_request("calendar integration is not configured")
            }
            other => ApiError::Upstream(other.to_string()),
        })?;
    Ok(Redirect::to(&url))
}

async fn calendar_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CalendarCallbackQuery>,
) -> Html<String> {
    let origin = state.config.app_base_url.as_str();
    if let Some(error) = query.error.as_deref() {
        warn!(error, "google calendar consent was not granted");
        return Html(render_calendar_popup(origin, Some(error)));
    }
    let Some(code) = query.code.as_deref().filter(|c| !c.trim().is_empty()) else {
        return Html(render_calendar_popup(origin, Some("missing_code")));
    };
    let Some(org_id) = query
        .state
        .as_deref()
        .and_then(|raw| state.calendar.verify_state(raw, Utc::now()))
    else {
        return Html(render_calendar_popup(origin, Some("invalid_state")));
    };

    match state.calendar.exchange(code.trim(), &org_id).await {
        Ok(()) => {
            info!(org_id = %org_id, "google calendar connected");
            Html(render_calendar_popup(origin, None))
        }
        Err(err) => {
            warn!(org_id = %org_id, error = %err, "google calendar exchange failed");
            Html(render_calendar_popup(origin, Some("exchange_failed")))
        }
    }
}

async fn schedule_sms(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
    JsonBody(payload): JsonBody<ScheduleSmsBody>,
) -> Result<impl IntoResponse, ApiError> {
    let scheduled_for = match payload.scheduled_for.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            parse_timestamp_utc(raw)
                .ok_or_else(|| ApiError::bad_request("scheduledFor must be an RFC 3339 timestamp"))?,
        ),
    };
    let message = sms::schedule_message(
        state.store.as_ref(),
        &session.org_id,
        payload.contact_id.trim(),
        &payload.body,
        scheduled_for,
        Utc::now(),
    )
    .await?;
    debug!(message_id = %message.id, org_id = %session.org_id, "sms scheduled");
    Ok((StatusCode::CREATED, Json(json!({ "message": message }))))
}

async fn send_scheduled_sms(
    _cron: CronAuth,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let report =
        sms::dispatch_due_messages(state.store.as_ref(), state.sms.as_ref(), Utc::now()).await?;
    if report.failed > 0 {
        state
            .slack
            .notify(&format!(
                "Scheduled SMS run: {} failed, {} sent.",
                report.failed, report.sent
            ))
            .await;
    }
    Ok(Json(json!({
        "ok": true,
        "processed": report.processed,
        "sent": report.sent,
        "failed": report.failed,
        "skipped": report.skipped,
        "expired": report.expired,
    })))
}

async fn list_inbox(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let conversations = state
        .store
        .list_inbox(&session.org_id, now)
        .await?
        .into_iter()
        .filter(|conversation| conversation.is_visible_at(now))
        .collect::<Vec<_>>();
    Ok(Json(json!({ "conversations": conversations })))
}

async fn snooze_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
    JsonBody(payload): JsonBody<SnoozeBody>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let until = match payload.snoozed_until.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => {
            let until = parse_timestamp_utc(raw)
                .ok_or_else(|| ApiError::bad_request("snoozedUntil must be an RFC 3339 timestamp"))?;
            if until <= now {
                return Err(ApiError::bad_request("snoozedUntil must be in the future"));
            }
            Some(until)
        }
    };

    let conversation = state
        .store
        .set_snoozed_until(&session.org_id, payload.conversation_id.trim(), until)
        .await?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn unsnooze_due(
    _cron: CronAuth,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let cleared = jobs::unsnooze_due_conversations(state.store.as_ref(), Utc::now()).await?;
    Ok(Json(json!({ "ok": true, "unsnoozed": cleared })))
}

async fn recording_cleanup(
    _cron: CronAuth,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let purged = jobs::purge_expired_recordings(state.store.as_ref(), now).await?;
    Ok(Json(json!({
        "ok": true,
        "purged": purged,
        "cutoff": jobs::recording_cutoff(now).to_rfc3339(),
    })))
}

async fn daily_stats_rollup(
    _cron: CronAuth,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let report = jobs::rollup_daily_stats(state.store.as_ref(), Utc::now()).await?;
    Ok(Json(json!({
        "ok": true,
        "date": report.date,
        "orgs": report.orgs,
        "created": report.created,
    })))
}

async fn usage_batch(
    State(state): State<Arc<AppState>>,
    MaybeAuthUser(session): MaybeAuthUser,
    body: Body,
) -> impl IntoResponse {
    let Some(session) = session else {
        debug!("usage batch without session dropped");
        return Json(json!({ "ok": true, "accepted": 0 }));
    };
    let body = match to_bytes(body, USAGE_BODY_LIMIT).await {
        Ok(body) => body,
        Err(err) => {
            warn!(org_id = %session.org_id, error = %err, "usage batch body unreadable");
            return Json(json!({ "ok": true, "accepted": 0 }));
        }
    };
    let events = jobs::parse_usage_batch(&body, Some(&session), Utc::now());
    let accepted = jobs::ingest_usage_events(state.store.as_ref(), &events).await;
    Json(json!({ "ok": true, "accepted": accepted }))
}

async fn transcribe_call(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
    Path(call_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let call = state
        .store
        .get_call_log(&session.org_id, &call_id)
        .await?
        .ok_or_else(|| ApiError::not_found("call not found"))?;
    let Some(recording_url) = call.recording_url.as_deref() else {
        return Err(ApiError::not_found("call has no recording"));
    };

    let transcript = state
        .transcriber
        .transcribe_url(recording_url)
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;
    state
        .store
        .save_transcript(&session.org_id, &call.id, &transcript.text)
        .await?;
    info!(call_id = %call.id, chars = transcript.text.len(), "call transcribed");
    Ok(Json(json!({ "callId": call.id, "transcript": transcript })))
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
    Path(kind): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind = record_kind(&kind)?;
    let records = state.store.list_records(&session.org_id, kind).await?;
    Ok(Json(json!({ "records": records })))
}

async fn create_record(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
    Path(kind): Path<String>,
    JsonBody(payload): JsonBody<CreateRecordBody>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = record_kind(&kind)?;
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("title is required"));
    }
    if !payload.data.is_object() {
        return Err(ApiError::bad_request("data must be an object"));
    }
    let now = Utc::now();
    let record = DashboardRecord {
        id: Uuid::new_v4().to_string(),
        org_id: session.org_id,
        kind,
        title: title.to_string(),
        data: payload.data,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_record(&record).await?;
    Ok((StatusCode::CREATED, Json(json!({ "record": record }))))
}

async fn update_record(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
    Path((kind, record_id)): Path<(String, String)>,
    JsonBody(payload): JsonBody<UpdateRecordBody>,
) -> Result<Json<Value>, ApiError> {
    let kind = record_kind(&kind)?;
    let title = payload.title.as_deref().map(str::trim);
    if title.is_some_and(str::is_empty) {
        return Err(ApiError::bad_request("title cannot be empty"));
    }
    if payload.data.as_ref().is_some_and(|data| !data.is_object()) {
        return Err(ApiError::bad_request("data must be an object"));
    }
    let record = state
        .store
        .update_record(
            &session.org_id,
            kind,
            &record_id,
            title,
            payload.data.as_ref(),
            Utc::now(),
        )
        .await?
        .ok_or_else(|| ApiError::not_found("record not found"))?;
    Ok(Json(json!({ "record": record })))
}

async fn delete_record(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
    Path((kind, record_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let kind = record_kind(&kind)?;
    if !state
        .store
        .delete_record(&session.org_id, kind, &record_id)
        .await?
    {
        return Err(ApiError::not_found("record not found"));
    }
    Ok(Json(json!({ "ok": true })))
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let settings = state
        .store
        .get_settings(&session.org_id)
        .await?
        .map(|row| row.settings)
        .unwrap_or_else(|| json!({}));
    Ok(Json(json!({ "settings": settings })))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    AuthUser(session): AuthUser,
    JsonBody(payload): JsonBody<Value>,
) -> Result<Json<Value>, ApiError> {
    let Value::Object(patch) = payload else {
        return Err(ApiError::bad_request("settings patch must be an object"));
    };
    let current = state
        .store
        .get_settings(&session.org_id)
        .await?
        .map(|row| row.settings)
        .unwrap_or_else(|| json!({}));
    let settings = OrgSettings {
        org_id: session.org_id,
        settings: merge_settings(current, &patch),
        updated_at: Utc::now(),
    };
    state.store.save_settings(&settings).await?;
    Ok(Json(json!({ "settings": settings.settings })))
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact().with_target(false))
        .init();

    for message in config_warnings(&config) {
        warn!("{message}");
    }

    let store = PgStore::connect(&config.database_url, DB_MAX_CONNECTIONS).await?;
    store.migrate().await?;

    let http = reqwest::Client::new();
    let sms: Arc<dyn SmsGateway> = Arc::new(TwilioClient::new(http.clone(), config.twilio.clone()));
    let port = config.port;
    let state = Arc::new(build_state(config, Arc::new(store), sms, http));
    if !state.slack.is_configured() {
        info!("slack notifications disabled, no webhook or bot token configured");
    }
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("opsdesk server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

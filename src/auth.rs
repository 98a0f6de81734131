//! Request authentication: dashboard sessions, the cron shared secret and the
//! hosted auth provider's PKCE code exchange.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{FromRequestParts, Query},
    http::{request::Parts, HeaderMap},
};
use axum_extra::{
    extract::cookie::{Cookie, CookieJar, SameSite},
    headers::{authorization::Bearer, Authorization, HeaderMapExt},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::AuthProviderConfig,
    error::ApiError,
    store::{Store, StoreError},
    types::{AppState, UserSession},
};

pub const SESSION_COOKIE: &str = "session";
pub const AUTH_ERROR_PATH: &str = "/auth/auth-code-error";
pub const DEFAULT_NEXT_PATH: &str = "/dashboard";

const CRON_SECRET_HEADER: &str = "x-cron-secret";
const CODE_VERIFIER_SUFFIX: &str = "code-verifier";
const AUTH_PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Session tokens are stored hashed; only the cookie holds the raw value.
pub fn hash_session_token(token: &str) -> String {
    sha256_hex(token)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().trim().to_string())
        .filter(|token| !token.is_empty())
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers).or_else(|| {
        CookieJar::from_headers(headers)
            .get(SESSION_COOKIE)
            .map(|cookie| cookie.value().trim().to_string())
            .filter(|token| !token.is_empty())
    })
}

async fn lookup_session(
    store: &dyn Store,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<UserSession>, StoreError> {
    let session = store
        .session_by_token_hash(&hash_session_token(token))
        .await?;
    Ok(session.filter(|session| session.expires_at > now))
}

/// The signed-in dashboard user. Rejects with 401 when no live session is
/// presented.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserSession);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("missing session"))?;
        lookup_session(state.store.as_ref(), &token, Utc::now())
            .await?
            .map(AuthUser)
            .ok_or_else(|| ApiError::unauthorized("invalid or expired session"))
    }
}

/// Like [`AuthUser`] but never rejects.
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<UserSession>);

impl FromRequestParts<Arc<AppState>> for MaybeAuthUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = session_token(&parts.headers) else {
            return Ok(MaybeAuthUser(None));
        };
        match lookup_session(state.store.as_ref(), &token, Utc::now()).await {
            Ok(session) => Ok(MaybeAuthUser(session)),
            Err(err) => {
                warn!(error = %err, "session lookup failed");
                Ok(MaybeAuthUser(None))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CronSecretQuery {
    secret: Option<String>,
}

fn presented_cron_secret(parts: &Parts) -> Option<String> {
    if let Some(token) = bearer_token(&parts.headers) {
        return Some(token);
    }
    if let Some(value) = parts
        .headers
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(value.to_string());
    }
    Query::<CronSecretQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.secret)
        .filter(|secret| !secret.is_empty())
}

pub fn check_cron_secret(expected: Option<&str>, presented: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        warn!("cron endpoint called but CRON_SECRET is not configured");
        return Err(ApiError::unauthorized("cron secret not configured"));
    };
    let Some(presented) = presented else {
        return Err(ApiError::unauthorized("missing cron secret"));
    };
    if presented.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("invalid cron secret".to_string()))
    }
}

/// Guard for scheduler-invoked endpoints.
#[derive(Debug, Clone, Copy)]
pub struct CronAuth;

impl FromRequestParts<Arc<AppState>> for CronAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let presented = presented_cron_secret(parts);
        check_cron_secret(state.config.cron_secret.as_deref(), presented.as_deref())?;
        Ok(CronAuth)
    }
}

/// Only same-site relative paths are honoured as post-login destinations.
pub fn safe_next_path(next: Option<&str>) -> String {
    match next.map(str::trim) {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => DEFAULT_NEXT_PATH.to_string(),
    }
}

/// Picks the PKCE verifier cookie left behind by the browser sign-in flow.
pub fn code_verifier_from_jar(jar: &CookieJar) -> Option<String> {
    jar.iter()
        .find(|cookie| cookie.name().ends_with(CODE_VERIFIER_SUFFIX))
        .map(|cookie| cookie.value().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(token: String, ttl_hours: i64, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::hours(ttl_hours))
        .build()
}

#[derive(Debug, Error)]
pub enum AuthProviderError {
    #[error("auth provider is not configured")]
    NotConfigured,

    #[error("auth provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("auth provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("auth provider response missing user")]
    InvalidResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthGrant {
    pub access_token: String,
    pub user: AuthProfile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Client for the hosted auth service's token endpoint.
pub struct AuthProviderClient {
    http: reqwest::Client,
    config: AuthProviderConfig,
}

impl AuthProviderClient {
    pub fn new(http: reqwest::Client, config: AuthProviderConfig) -> Self {
        Self { http, config }
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<AuthGrant, AuthProviderError> {
        let (Some(api_url), Some(anon_key)) = (
            self.config.api_url.as_deref(),
            self.config.anon_key.as_deref(),
        ) else {
            return Err(AuthProviderError::NotConfigured);
        };

        let response = self
            .http
            .post(format!("{}/auth/v1/token", api_url.trim_end_matches('/')))
            .query(&[("grant_type", "pkce")])
            .header("apikey", anon_key)
            .json(&json!({
                "auth_code": code,
                "code_verifier": code_verifier.unwrap_or_default(),
            }))
            .timeout(AUTH_PROVIDER_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthProviderError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json::<AuthGrant>()
            .await
            .map_err(|_| AuthProviderError::InvalidResponse)
    }
}

#[derive(Debug, Error)]
pub enum SignInError {
    #[error(transparent)]
    Provider(#[from] AuthProviderError),

    #[error("user {0} has no org membership")]
    NoMembership(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub session: UserSession,
}

/// Trades an authorization code for a dashboard session bound to the user's
/// primary org.
pub async fn establish_session(
    store: &dyn Store,
    provider: &AuthProviderClient,
    code: &str,
    code_verifier: Option<&str>,
    ttl_hours: i64,
    now: DateTime<Utc>,
) -> Result<IssuedSession, SignInError> {
    let grant = provider.exchange_code(code, code_verifier).await?;
    let org_id = store
        .primary_org_for_user(&grant.user.id)
        .await?
        .ok_or_else(|| SignInError::NoMembership(grant.user.id.clone()))?;

    let token = Uuid::new_v4().to_string();
    let session = UserSession {
        user_id: grant.user.id,
        org_id,
        email: grant.user.email.unwrap_or_default(),
        expires_at: now + ChronoDuration::hours(ttl_hours),
    };
    store
        .create_session(&hash_session_token(&token), &session)
        .await?;
    debug!(user_id = %session.user_id, org_id = %session.org_id, "session issued");
    Ok(IssuedSession { token, session })
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn provider(base: String) -> AuthProviderClient {
        AuthProviderClient::new(
            reqwest::Client::new(),
            AuthProviderConfig {
                api_url: Some(base),
                anon_key: Some("anon".to_string()),
            },
        )
    }

    #[test]
    fn cron_secret_outcomes() {
        assert!(check_cron_secret(Some("s3cret"), Some("s3cret")).is_ok());
        assert!(matches!(
            check_cron_secret(Some("s3cret"), None),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            check_cron_secret(Some("s3cret"), Some("s3cre")),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            check_cron_secret(None, Some("anything")),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn next_path_only_allows_local_destinations() {
        assert_eq!(safe_next_path(Some("/inbox?tab=sms")), "/inbox?tab=sms");
        assert_eq!(safe_next_path(None), DEFAULT_NEXT_PATH);
        assert_eq!(safe_next_path(Some("https://evil.example")), DEFAULT_NEXT_PATH);
        assert_eq!(safe_next_path(Some("//evil.example")), DEFAULT_NEXT_PATH);
        assert_eq!(safe_next_path(Some("/\\evil.example")), DEFAULT_NEXT_PATH);
    }

    #[test]
    fn session_cookie_is_http_only() {
        let rendered = session_cookie("tok".to_string(), 2, true).to_string();
        assert!(rendered.starts_with("session=tok"));
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("Secure"));
        assert!(rendered.contains("SameSite=Lax"));
        assert!(rendered.contains("Max-Age=7200"));
    }

    #[test]
    fn verifier_cookie_is_found_by_suffix() {
        let jar = CookieJar::new()
            .add(Cookie::new("theme", "dark"))
            .add(Cookie::new("sb-abc-auth-token-code-verifier", "\"v123\""));
        assert_eq!(code_verifier_from_jar(&jar).as_deref(), Some("v123"));
    }

    #[tokio::test]
    async fn establish_session_stores_hashed_token() {
        let server = MockServer::start();
        let token_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/v1/token")
                .query_param("grant_type", "pkce")
                .header("apikey", "anon")
                .json_body(json!({ "auth_code": "abc", "code_verifier": "v1" }));
            then.status(200).json_body(json!({
                "access_token": "jwt",
                "user": { "id": "user-1", "email": "owner@example.com" }
            }));
        });
        let store = MemoryStore::new();
        let now = Utc::now();
        store.add_membership("org-newer", "user-1", now).await;
        store
            .add_membership("org-first", "user-1", now - ChronoDuration::days(30))
            .await;

        let issued = establish_session(
            &store,
            &provider(server.base_url()),
            "abc",
            Some("v1"),
            24,
            now,
        )
        .await
        .expect("session");

        token_mock.assert();
        assert_eq!(issued.session.org_id, "org-first");
        let stored = store
            .session_by_token_hash(&hash_session_token(&issued.token))
            .await
            .expect("lookup")
            .expect("stored");
        assert_eq!(stored.email, "owner@example.com");
        assert!(store
            .session_by_token_hash(&issued.token)
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn establish_session_requires_membership() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/v1/token");
            then.status(200)
                .json_body(json!({ "access_token": "jwt", "user": { "id": "orphan" } }));
        });
        let store = MemoryStore::new();

        let err = establish_session(&store, &provider(server.base_url()), "abc", None, 24, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SignInError::NoMembership(ref id) if id == "orphan"));
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn expired_sessions_are_ignored() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_session(
                &hash_session_token("old"),
                &UserSession {
                    user_id: "u".to_string(),
                    org_id: "o".to_string(),
                    email: String::new(),
                    expires_at: now - ChronoDuration::minutes(1),
                },
            )
            .await
            .expect("insert");

        assert!(lookup_session(&store, "old", now).await.expect("lookup").is_none());
    }
}

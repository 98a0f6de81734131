//! Google Calendar OAuth bridge: consent redirect, signed `state`, and the
//! relay of the authorization code to the token-exchange backend.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use url::Url;

use crate::config::CalendarConfig;

pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";
pub const STATE_TTL_SECONDS: i64 = 600;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("calendar integration is not configured")]
    NotConfigured,

    #[error("invalid authorize url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("calendar exchange request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("calendar exchange returned {status}: {body}")]
    Status { status: u16, body: String },
}

fn state_signature(secret: &str, org_id: &str, exp: i64) -> Option<Hmac<Sha256>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{org_id}:{exp}").as_bytes());
    Some(mac)
}

/// `state` is `<org_id>.<exp>.<hex hmac>`; without a secret it is the bare
/// org id.
pub fn sign_state(secret: Option<&str>, org_id: &str, exp: i64) -> String {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return org_id.to_string();
    };
    match state_signature(secret, org_id, exp) {
        Some(mac) => format!(
            "{org_id}.{exp}.{}",
            hex::encode(mac.finalize().into_bytes())
        ),
        None => org_id.to_string(),
    }
}

/// Returns the org id carried by a valid, unexpired `state`.
pub fn verify_state(secret: Option<&str>, state: &str, now: DateTime<Utc>) -> Option<String> {
    let state = state.trim();
    if state.is_empty() {
        return None;
    }
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return Some(state.to_string());
    };

    let mut parts = state.rsplitn(3, '.');
    let sig = parts.next()?;
    let exp = parts.next()?.parse::<i64>().ok()?;
    let org_id = parts.next().filter(|id| !id.is_empty())?;
    if exp < now.timestamp() {
        return None;
    }
    let signature_bytes = hex::decode(sig).ok()?;
    let mac = state_signature(secret, org_id, exp)?;
    mac.verify_slice(&signature_bytes).ok()?;
    Some(org_id.to_string())
}

pub struct CalendarClient {
    http: reqwest::Client,
    config: CalendarConfig,
}

impl CalendarClient {
    pub fn new(http: reqwest::Client, config: CalendarConfig) -> Self {
        Self { http, config }
    }

    pub fn authorization_url(&self, state: &str) -> Result<String, CalendarError> {
        let (Some(client_id), Some(redirect_uri)) = (
            self.config.client_id.as_deref(),
            self.config.redirect_uri.as_deref(),
        ) else {
            return Err(CalendarError::NotConfigured);
        };
        let url = Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("client_id", client_id),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", CALENDAR_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("include_granted_scopes", "true"),
                ("state", state),
            ],
        )?;
        Ok(url.into())
    }

    /// Consent URL for an org, with a freshly signed `state`.
    pub fn connect_url(&self, org_id: &str, now: DateTime<Utc>) -> Result<String, CalendarError> {
        let state = sign_state(
            self.config.state_secret.as_deref(),
            org_id,
            now.timestamp() + STATE_TTL_SECONDS,
        );
        self.authorization_url(&state)
    }

    pub fn verify_state(&self, state: &str, now: DateTime<Utc>) -> Option<String> {
        verify_state(self.config.state_secret.as_deref(), state, now)
    }

    /// Hands the authorization code to the backend that owns the refresh
    /// token.
    pub async fn exchange(&self, code: &str, org_id: &str) -> Result<(), CalendarError> {
        let exchange_url = self
            .config
            .exchange_url
            .as_deref()
            .ok_or(CalendarError::NotConfigured)?;

        let mut request = self
            .http
            .post(exchange_url)
            .json(&json!({
                "code": code,
                "orgId": org_id,
                "redirectUri": self.config.redirect_uri,
            }))
            .timeout(EXCHANGE_TIMEOUT);
        if let Some(token) = self.config.exchange_token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(CalendarError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

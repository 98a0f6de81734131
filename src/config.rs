//! Runtime configuration, read from the environment (and `.env` when present).

use std::env;

#[derive(Debug, Clone, Default)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeepgramConfig {
    pub api_key: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone, Default)]
pub struct SlackConfig {
    pub webhook_url: Option<String>,
    pub bot_token: Option<String>,
    pub channel: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuthProviderConfig {
    /// Base URL of the hosted auth service, e.g. `https://<ref>.supabase.co`.
    pub api_url: Option<String>,
    pub anon_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CalendarConfig {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub authorize_url: String,
    /// Backend endpoint that trades the authorization code for tokens.
    pub exchange_url: Option<String>,
    pub exchange_token: Option<String>,
    /// HMAC key for the `state` parameter.
    pub state_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub cron_secret: Option<String>,
    pub app_base_url: String,
    pub session_ttl_hours: i64,
    pub secure_cookies: bool,
    pub twilio: TwilioConfig,
    pub deepgram: DeepgramConfig,
    pub slack: SlackConfig,
    pub auth_provider: AuthProviderConfig,
    pub calendar: CalendarConfig,
}

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_SESSION_TTL_HOURS: i64 = 168;

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = get("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let app_base_url = get("APP_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();
        let secure_cookies = get("SECURE_COOKIES")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or_else(|| app_base_url.starts_with("https://"));

        Self {
            port,
            database_url: resolve_database_url(&get),
            cron_secret: get("CRON_SECRET"),
            app_base_url,
            session_ttl_hours: get("SESSION_TTL_HOURS")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|hours| *hours > 0)
                .unwrap_or(DEFAULT_SESSION_TTL_HOURS),
            secure_cookies,
            twilio: TwilioConfig {
                account_sid: get("TWILIO_ACCOUNT_SID"),
                auth_token: get("TWILIO_AUTH_TOKEN"),
                from_number: get("TWILIO_FROM_NUMBER"),
                api_base: get("TWILIO_API_BASE")
                    .unwrap_or_else(|| "https://api.twilio.com".to_string()),
            },
            deepgram: DeepgramConfig {
                api_key: get("DEEPGRAM_API_KEY"),
                api_base: get("DEEPGRAM_API_BASE")
                    .unwrap_or_else(|| "https://api.deepgram.com".to_string()),
            },
            slack: SlackConfig {
                webhook_url: get("SLACK_WEBHOOK_URL"),
                bot_token: get("SLACK_BOT_TOKEN"),
                channel: get("SLACK_CHANNEL"),
                api_base: get("SLACK_API_BASE")
                    .unwrap_or_else(|| "https://slack.com/api".to_string()),
            },
            auth_provider: AuthProviderConfig {
                api_url: get("AUTH_API_URL"),
                anon_key: get("AUTH_ANON_KEY"),
            },
            calendar: CalendarConfig {
                client_id: get("GOOGLE_CLIENT_ID"),
                redirect_uri: get("GOOGLE_REDIRECT_URI"),
                authorize_url: get("GOOGLE_AUTHORIZE_URL").unwrap_or_else(|| {
                    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
                }),
                exchange_url: get("CALENDAR_EXCHANGE_URL"),
                exchange_token: get("CALENDAR_EXCHANGE_TOKEN"),
                state_secret: get("OAUTH_STATE_SECRET"),
            },
        }
    }
}

fn resolve_database_url<F>(get: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = get("DATABASE_URL") {
        return url;
    }
    let host = get("POSTGRES_HOST")
        .or_else(|| get("PGHOST"))
        .unwrap_or_else(|| "localhost".to_string());
    let port = get("POSTGRES_PORT")
        .or_else(|| get("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = get("POSTGRES_USER")
        .or_else(|| get("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = get("POSTGRES_PASSWORD")
        .or_else(|| get("PGPASSWORD"))
        .unwrap_or_default();
    let db = get("POSTGRES_DB")
        .or_else(|| get("PGDATABASE"))
        .unwrap_or_else(|| "opsdesk".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::DeepgramConfig;

const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("transcription is not configured")]
    NotConfigured,

    #[error("transcription request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("transcription provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transcription response missing transcript")]
    InvalidResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f64>,
    pub duration_seconds: Option<f64>,
}

/// Deepgram pre-recorded audio client.
pub struct DeepgramClient {
    http: reqwest::Client,
    config: DeepgramConfig,
}

impl DeepgramClient {
    pub fn new(http: reqwest::Client, config: DeepgramConfig) -> Self {
        Self { http, config }
    }

    /// Transcribes a hosted recording by URL.
    pub async fn transcribe_url(&self, audio_url: &str) -> Result<Transcript, TranscriptionError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(TranscriptionError::NotConfigured)?;

        let response = self
            .http
            .post(format!(
                "{}/v1/listen",
                self.config.api_base.trim_end_matches('/')
            ))
            .query(&[
                ("model", "nova-2"),
                ("smart_format", "true"),
                ("punctuate", "true"),
            ])
            .header("Authorization", format!("Token {api_key}"))
            .json(&json!({ "url": audio_url }))
            .timeout(TRANSCRIBE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TranscriptionError::Status {
                status: status.as_u16(),
                body: raw_body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let body =
            serde_json::from_str::<Value>(&raw_body).map_err(|_| TranscriptionError::InvalidResponse)?;
        parse_transcript(&body).ok_or(TranscriptionError::InvalidResponse)
    }
}

fn parse_transcript(body: &Value) -> Option<Transcript> {
    let alternative = body.pointer("/results/channels/0/alternatives/0")?;
    let text = alternative.get("transcript")?.as_str()?.trim().to_string();
    Some(Transcript {
        text,
        confidence: alternative.get("confidence").and_then(Value::as_f64),
        duration_seconds: body.pointer("/metadata/duration").and_then(Value::as_f64),
    })
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    fn client(base: String, api_key: Option<&str>) -> DeepgramClient {
        DeepgramClient::new(
            reqwest::Client::new(),
            DeepgramConfig {
                api_key: api_key.map(str::to_string),
                api_base: base,
            },
        )
    }

    #[tokio::test]
    async fn transcribe_url_reads_first_alternative() {
        let server = MockServer::start();
        let listen = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/listen")
                .query_param("model", "nova-2")
                .header("authorization", "Token dg-key")
                .json_body(json!({ "url": "https://cdn.example.com/call.mp3" }));
            then.status(200).json_body(json!({
                "metadata": { "duration": 42.5 },
                "results": { "channels": [ { "alternatives": [
                    { "transcript": " Thanks for calling. ", "confidence": 0.93 }
                ] } ] }
            }));
        });

        let transcript = client(server.base_url(), Some("dg-key"))
            .transcribe_url("https://cdn.example.com/call.mp3")
            .await
            .expect("transcript");
        listen.assert();
        assert_eq!(transcript.text, "Thanks for calling.");
        assert_eq!(transcript.confidence, Some(0.93));
        assert_eq!(transcript.duration_seconds, Some(42.5));
    }

    #[tokio::test]
    async fn upstream_errors_are_surfaced() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/listen");
            then.status(401).body("{\"err_code\":\"INVALID_AUTH\"}");
        });

        let err = client(server.base_url(), Some("bad"))
            .transcribe_url("https://cdn.example.com/call.mp3")
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::Status { status: 401, .. }));

        let err = client(server.base_url(), None)
            .transcribe_url("https://cdn.example.com/call.mp3")
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::NotConfigured));
    }

    #[test]
    fn parse_transcript_rejects_missing_alternatives() {
        assert!(parse_transcript(&json!({ "results": { "channels": [] } })).is_none());
    }
}

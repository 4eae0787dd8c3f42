use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use super::{TranscribeError, Transcriber};
use crate::config::TranscriberConfig;

/// Production transcriber: JSON POST against a configured endpoint.
/// One model per deployment; the identifier rides along on every request.
pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    model: &'a str,
    audio: &'a str,
    mime_type: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
}

impl HttpTranscriber {
    pub fn new(config: &TranscriberConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            info!(
                "No API key in {}; transcriber requests will be unauthenticated",
                config.api_key_env
            );
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        audio_b64: &str,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, TranscribeError> {
        let mut request = self.client.post(&self.endpoint).json(&TranscribeRequest {
            model: &self.model,
            audio: audio_b64,
            mime_type,
            prompt,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TranscribeError::timeout(e.to_string())
            } else {
                TranscribeError::connection(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = parse_retry_after(response.headers());
            return Err(TranscribeError::rate_limited(
                format!("transcriber rate limited ({})", status),
                retry_after,
            ));
        }
        if status.is_server_error() {
            return Err(TranscribeError::server(format!(
                "transcriber returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscribeError::invalid(format!(
                "transcriber rejected request ({}): {}",
                status, body
            )));
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| TranscribeError::invalid(format!("malformed transcriber response: {}", e)))?;
        Ok(parsed.text)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_parse_retry_after_absent_or_http_date() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        // HTTP-date form is ignored; the computed back-off applies instead
        assert_eq!(parse_retry_after(&headers), None);
    }
}

//! HTTP implementation of [`GenerationProvider`]
//!
//! Sends one JSON request per call to a text or speech endpoint:
//!
//! ```json
//! { "content": "...", "model": "...", "voice": "...", "parameters": { "k": "v" } }
//! ```
//!
//! The credential travels in a configurable header (default `x-api-key`), never
//! in the URL, so transport errors cannot leak it through the request path.
//!
//! ## Response Format
//!
//! - Text endpoint: JSON with the generated text in `text`, `result` or `content`.
//! - Speech endpoint: either raw audio bytes (`audio/*` or
//!   `application/octet-stream`) or JSON `{ "audio": "<base64>", "mime_type": "..." }`.
//!
//! Non-success statuses are returned as [`ProviderError::Status`] together with
//! the `Retry-After` header when the service sends one.

use crate::provider::provider::GenerationProvider;
use crate::provider::types::{
    GenerationKind, GenerationOutput, GenerationRequest, ProviderConfig, ProviderError,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub struct HttpProvider {
    client: Client,
    config: ProviderConfig,
    text_url: Url,
    speech_url: Url,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            ProviderError::InvalidResponse(format!("invalid base url '{}': {}", config.base_url, e))
        })?;
        let text_url = base
            .join(&config.text_path)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid text path: {}", e)))?;
        let speech_url = base
            .join(&config.speech_path)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid speech path: {}", e)))?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("gengate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Transport(format!("http client build failed: {}", e)))?;

        Ok(Self {
            client,
            config,
            text_url,
            speech_url,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        serde_json::json!({
            "content": request.content,
            "model": request.model.as_ref().or(self.config.default_model.as_ref()),
            "voice": request.voice.as_ref().or(self.config.default_voice.as_ref()),
            "parameters": request.parameters,
        })
    }

    async fn read_text(response: Response) -> Result<GenerationOutput, ProviderError> {
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to read body: {}", e)))?;

        let text = match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(json) => extract_text(&json).ok_or_else(|| {
                ProviderError::InvalidResponse("no text field in response".to_string())
            })?,
            // Plain-text bodies are accepted as-is
            Err(_) => body,
        };

        Ok(GenerationOutput::Text { text })
    }

    async fn read_audio(response: Response) -> Result<GenerationOutput, ProviderError> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to read body: {}", e)))?;

        if content_type.starts_with("application/json") {
            let json: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            return decode_audio_json(&json);
        }

        if body.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "empty audio response".to_string(),
            ));
        }

        Ok(GenerationOutput::Audio {
            bytes: body.to_vec(),
            mime_type: content_type,
        })
    }
}

impl GenerationProvider for HttpProvider {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
        credential: &'a SecretString,
    ) -> BoxFuture<'a, Result<GenerationOutput, ProviderError>> {
        Box::pin(async move {
            let url = match request.kind {
                GenerationKind::Text => self.text_url.clone(),
                GenerationKind::Speech => self.speech_url.clone(),
            };

            debug!(
                "POST {} ({:?}, {} chars)",
                url,
                request.kind,
                request.content.chars().count()
            );

            let response = self
                .client
                .post(url)
                .header(self.config.auth_header.as_str(), credential.expose_secret())
                .json(&self.request_body(request))
                .send()
                .await
                .map_err(|e| ProviderError::Transport(e.without_url().to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = parse_retry_after(response.headers(), Utc::now());
                let message = response.text().await.unwrap_or_default();
                return Err(ProviderError::Status {
                    status: status.as_u16(),
                    message,
                    retry_after,
                });
            }

            match request.kind {
                GenerationKind::Text => Self::read_text(response).await,
                GenerationKind::Speech => Self::read_audio(response).await,
            }
        })
    }

    fn provider_name(&self) -> &'static str {
        "http"
    }
}

/// Pull the generated text out of a JSON body
fn extract_text(json: &serde_json::Value) -> Option<String> {
    ["text", "result", "content"]
        .iter()
        .find_map(|field| json.get(field).and_then(|v| v.as_str()))
        .map(str::to_string)
}

fn decode_audio_json(json: &serde_json::Value) -> Result<GenerationOutput, ProviderError> {
    let encoded = json
        .get("audio")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProviderError::InvalidResponse("no audio field in response".to_string()))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ProviderError::InvalidResponse(format!("invalid base64 audio: {}", e)))?;
    let mime_type = json
        .get("mime_type")
        .and_then(|v| v.as_str())
        .unwrap_or("audio/mpeg")
        .to_string();

    Ok(GenerationOutput::Audio { bytes, mime_type })
}

/// `Retry-After` as delta-seconds or an HTTP date
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<f64>() {
        // Capped at a day so absurd values cannot overflow the conversion
        return (seconds.is_finite() && seconds >= 0.0)
            .then(|| Duration::from_secs_f64(seconds.min(86_400.0)));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(
            parse_retry_after(&headers, Utc::now()),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:30 GMT"),
        );
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_parse_retry_after_missing_or_garbage() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers, Utc::now()), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, Utc::now()), None);
    }

    #[test]
    fn test_extract_text_field_priority() {
        let json = serde_json::json!({ "result": "from result", "content": "from content" });
        assert_eq!(extract_text(&json).as_deref(), Some("from result"));

        let json = serde_json::json!({ "other": 1 });
        assert_eq!(extract_text(&json), None);
    }

    #[test]
    fn test_decode_audio_json() {
        let json = serde_json::json!({ "audio": STANDARD.encode([1u8, 2, 3]), "mime_type": "audio/wav" });
        let output = decode_audio_json(&json).unwrap();
        assert_eq!(
            output,
            GenerationOutput::Audio {
                bytes: vec![1, 2, 3],
                mime_type: "audio/wav".to_string()
            }
        );

        let bad = serde_json::json!({ "audio": "***" });
        assert!(decode_audio_json(&bad).is_err());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = ProviderConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(HttpProvider::new(config).is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What the provider is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Text,
    Speech,
}

/// Provider-agnostic generation request.
///
/// Only the fields below are considered "semantic": two requests with equal
/// fields produce the same cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub content: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl GenerationRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: GenerationKind::Text,
            content: content.into(),
            voice: None,
            model: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn speech(content: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            kind: GenerationKind::Speech,
            content: content.into(),
            voice: Some(voice.into()),
            model: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Same request parameters applied to different content (used for chunks)
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }
}

/// Result produced by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationOutput {
    Text { text: String },
    Audio { bytes: Vec<u8>, mime_type: String },
}

impl GenerationOutput {
    pub fn kind(&self) -> GenerationKind {
        match self {
            GenerationOutput::Text { .. } => GenerationKind::Text,
            GenerationOutput::Audio { .. } => GenerationKind::Speech,
        }
    }

    /// Characters for text, bytes for audio
    pub fn len(&self) -> usize {
        match self {
            GenerationOutput::Text { text } => text.chars().count(),
            GenerationOutput::Audio { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            GenerationOutput::Text { text } => Some(text),
            GenerationOutput::Audio { .. } => None,
        }
    }
}

/// Errors reported by a provider before any classification happens
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider returned status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// HTTP provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub text_path: String,
    pub speech_path: String,
    /// Header carrying the credential
    pub auth_header: String,
    pub default_model: Option<String>,
    pub default_voice: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/".to_string(),
            text_path: "v1/generate/text".to_string(),
            speech_path: "v1/generate/speech".to_string(),
            auth_header: "x-api-key".to_string(),
            default_model: None,
            default_voice: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

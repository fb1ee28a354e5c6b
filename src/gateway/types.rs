use crate::provider::{GenerationRequest, ProviderConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub type TaskId = String;
pub type CredentialId = String;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Directory holding the persistent cache and usage records
    pub data_dir: Option<PathBuf>,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub throttle: ThrottleConfig,
    pub retry: RetryConfig,
    pub segment: SegmentConfig,
    pub provider: ProviderConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Initial credentials; never written back when the config is saved
    #[serde(default, skip_serializing)]
    pub credentials: Vec<String>,
    pub credential_pattern: String,
    pub default_cooldown: Duration,
    pub daily_quota_per_credential: u64,
    pub persist_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_capacity: usize,
    pub persistent_capacity: usize,
    pub max_age: Duration,
    pub compaction_interval: Duration,
    pub persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_in_flight: usize,
    pub base_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub decrease_step: Duration,
    pub increase_step: Duration,
    pub successes_per_decrease: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub mode: RetryMode,
    pub auto_max_attempts: u32,
    pub persistent_max_attempts: u32,
    /// Persistent mode: attempts between extended waits
    pub persistent_reset_every: u32,
    pub extended_wait: Duration,
    pub unknown_max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff_delay: Duration,
    /// Pause before retrying on a freshly rotated credential
    pub rotation_delay: Duration,
    /// Relative jitter applied to backoff delays (0.1 = ±10%)
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Content longer than this (in characters) is split
    pub threshold: usize,
    pub max_chunk: usize,
    pub min_chunk: usize,
    pub text_separator: String,
}

/// Retry budget used by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Short budget; failure is surfaced so the caller can fall back
    Auto,
    /// Long budget for callers without a fallback path
    Persistent,
}

/// One unit of work submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: GenerationRequest,
    /// Lower values run first within a batch
    #[serde(default)]
    pub priority: Option<u32>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, payload: GenerationRequest) -> Self {
        Self {
            id: id.into(),
            payload,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Derived view of the credential pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_slots: usize,
    pub available_slots: usize,
    pub usage_ratio: f64,
    pub next_available_at: Option<DateTime<Utc>>,
    pub exhausted: bool,
}

impl PoolStatus {
    pub fn empty() -> Self {
        Self {
            total_slots: 0,
            available_slots: 0,
            usage_ratio: 0.0,
            next_available_at: None,
            exhausted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RateLimited,
    Unauthorized,
    NetworkError,
    ServerError,
    QuotaExceeded,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Rate limit exceeded after {attempts} attempts: {message}")]
    RateLimited {
        message: String,
        attempts: u32,
        retry_at: Option<DateTime<Utc>>,
    },
    #[error("Credential rejected: {0}")]
    Unauthorized(String),
    #[error("Network error after {attempts} attempts: {message}")]
    Network { message: String, attempts: u32 },
    #[error("Server error after {attempts} attempts: {message}")]
    Server { message: String, attempts: u32 },
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Unknown error after {attempts} attempts: {message}")]
    Unknown { message: String, attempts: u32 },
    #[error("No credential available")]
    NoCredentials,
    #[error("{failed} of {total} chunks failed: {first_error}")]
    Segment {
        failed: usize,
        total: usize,
        first_error: Box<GatewayError>,
    },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Build the terminal error for a classified failure
    pub fn classified(kind: ErrorKind, message: String, attempts: u32) -> Self {
        match kind {
            ErrorKind::RateLimited => GatewayError::RateLimited {
                message,
                attempts,
                retry_at: None,
            },
            ErrorKind::Unauthorized => GatewayError::Unauthorized(message),
            ErrorKind::NetworkError => GatewayError::Network { message, attempts },
            ErrorKind::ServerError => GatewayError::Server { message, attempts },
            ErrorKind::QuotaExceeded => GatewayError::QuotaExceeded(message),
            ErrorKind::Unknown => GatewayError::Unknown { message, attempts },
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            GatewayError::RateLimited { .. } => Some(ErrorKind::RateLimited),
            GatewayError::Unauthorized(_) => Some(ErrorKind::Unauthorized),
            GatewayError::Network { .. } => Some(ErrorKind::NetworkError),
            GatewayError::Server { .. } => Some(ErrorKind::ServerError),
            GatewayError::QuotaExceeded(_) => Some(ErrorKind::QuotaExceeded),
            GatewayError::Unknown { .. } => Some(ErrorKind::Unknown),
            GatewayError::Segment { first_error, .. } => first_error.kind(),
            GatewayError::NoCredentials
            | GatewayError::InvalidRequest(_)
            | GatewayError::Configuration(_)
            | GatewayError::Storage(_)
            | GatewayError::ShuttingDown => None,
        }
    }

    /// Whether offering the user a manual retry makes sense
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::RateLimited { .. }
            | GatewayError::Network { .. }
            | GatewayError::Server { .. }
            | GatewayError::Unknown { .. } => true,
            GatewayError::Segment { first_error, .. } => first_error.is_retryable(),
            GatewayError::Unauthorized(_)
            | GatewayError::QuotaExceeded(_)
            | GatewayError::NoCredentials
            | GatewayError::InvalidRequest(_)
            | GatewayError::Configuration(_)
            | GatewayError::Storage(_)
            | GatewayError::ShuttingDown => false,
        }
    }

    /// Short message suitable for end users
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::RateLimited { retry_at, .. } => match retry_at {
                Some(at) => format!(
                    "The service is busy. Try again after {}.",
                    at.format("%H:%M:%S UTC")
                ),
                None => "The service is busy. Try again in a minute.".to_string(),
            },
            GatewayError::Unauthorized(_) => {
                "A credential was rejected. Check the configured API keys.".to_string()
            }
            GatewayError::Network { .. } => {
                "Could not reach the service. Check the network connection.".to_string()
            }
            GatewayError::Server { .. } => {
                "The service is having problems. Try again later.".to_string()
            }
            GatewayError::QuotaExceeded(_) => {
                "The usage quota is exhausted for today.".to_string()
            }
            GatewayError::Unknown { .. } => "Generation failed unexpectedly.".to_string(),
            GatewayError::NoCredentials => "No API key is configured.".to_string(),
            GatewayError::Segment { failed, total, .. } => {
                format!("{} of {} parts could not be generated.", failed, total)
            }
            GatewayError::InvalidRequest(message) => format!("Invalid request: {}", message),
            GatewayError::Configuration(message) => format!("Invalid configuration: {}", message),
            GatewayError::Storage(_) => "Local storage could not be updated.".to_string(),
            GatewayError::ShuttingDown => "The gateway is shutting down.".to_string(),
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("credentials", &format!("[{} redacted]", self.credentials.len()))
            .field("credential_pattern", &self.credential_pattern)
            .field("default_cooldown", &self.default_cooldown)
            .field("daily_quota_per_credential", &self.daily_quota_per_credential)
            .field("persist_usage", &self.persist_usage)
            .finish()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            credential_pattern: r"^[A-Za-z0-9_\-.]{16,256}$".to_string(),
            default_cooldown: Duration::from_secs(60),
            daily_quota_per_credential: 1500,
            persist_usage: true,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 100,
            persistent_capacity: 200,
            max_age: Duration::from_secs(86400 * 7), // 7 days
            compaction_interval: Duration::from_secs(3600),
            persistent: true,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 2,
            base_delay: Duration::from_millis(1000),
            min_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(2000),
            decrease_step: Duration::from_millis(50),
            increase_step: Duration::from_millis(250),
            successes_per_decrease: 3,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::Auto,
            auto_max_attempts: 3,
            persistent_max_attempts: 30,
            persistent_reset_every: 10,
            extended_wait: Duration::from_secs(60),
            unknown_max_attempts: 2,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff_delay: Duration::from_secs(60),
            rotation_delay: Duration::from_millis(300),
            jitter: 0.1,
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            threshold: 200,
            max_chunk: 200,
            min_chunk: 20,
            text_separator: " ".to_string(),
        }
    }
}

use crate::gateway::types::{ErrorKind, RetryConfig, RetryMode};
use crate::provider::ProviderError;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

static RETRY_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:retry in|retry after|retrydelay"?\s*:\s*"?)\s*(\d+(?:\.\d+)?)\s*(ms|s)\b"#)
        .expect("static regex")
});

static QUOTA_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(per[ _-]?day|daily|billing|insufficient[ _]quota|quota[ _]exhausted)")
        .expect("static regex")
});

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"AIza[0-9A-Za-z_\-]{35}").expect("static regex"),
            "[REDACTED]",
        ),
        (
            Regex::new(r"sk-[A-Za-z0-9_\-]{16,}").expect("static regex"),
            "[REDACTED]",
        ),
        (
            Regex::new(r"(?i)\b(key|api_key|apikey|token|access_token)=[^&\s'\x22]+")
                .expect("static regex"),
            "$1=[REDACTED]",
        ),
        (
            Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").expect("static regex"),
            "Bearer [REDACTED]",
        ),
    ]
});

/// Map a provider failure onto the gateway's error taxonomy
pub fn classify(error: &ProviderError) -> ErrorKind {
    match error {
        ProviderError::Transport(_) => ErrorKind::NetworkError,
        ProviderError::InvalidResponse(_) => ErrorKind::Unknown,
        ProviderError::Status {
            status, message, ..
        } => match *status {
            429 if QUOTA_MARKERS.is_match(message) => ErrorKind::QuotaExceeded,
            429 => ErrorKind::RateLimited,
            403 if QUOTA_MARKERS.is_match(message) => ErrorKind::QuotaExceeded,
            401 | 403 => ErrorKind::Unauthorized,
            408 => ErrorKind::NetworkError,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        },
    }
}

/// Provider-supplied wait: the `Retry-After` header, else a "retry in Ns" hint in the body
pub fn retry_hint(error: &ProviderError) -> Option<Duration> {
    let ProviderError::Status {
        message,
        retry_after,
        ..
    } = error
    else {
        return None;
    };

    if retry_after.is_some() {
        return *retry_after;
    }

    let captures = RETRY_IN.captures(message)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let seconds = match captures.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "ms" => value / 1000.0,
        _ => value,
    };
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds.min(86_400.0)))
}

/// Strip credential material from a message before it is logged or surfaced
pub fn redact(message: &str, secrets: &[&str]) -> String {
    let mut redacted = message.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        redacted = redacted.replace(secret, "[REDACTED]");
    }
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        redacted = pattern.replace_all(&redacted, *replacement).into_owned();
    }
    redacted
}

/// Retry budget and delays per error kind
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn default_mode(&self) -> RetryMode {
        self.config.mode
    }

    pub fn max_attempts(&self, mode: RetryMode) -> u32 {
        match mode {
            RetryMode::Auto => self.config.auto_max_attempts.max(1),
            RetryMode::Persistent => self.config.persistent_max_attempts.max(1),
        }
    }

    pub fn max_delay(&self) -> Duration {
        self.config.max_backoff_delay
    }

    /// Whether another attempt follows the failed `attempt` (1-based)
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32, mode: RetryMode) -> bool {
        if attempt >= self.max_attempts(mode) {
            return false;
        }

        match kind {
            ErrorKind::RateLimited => true,
            ErrorKind::NetworkError => true,
            ErrorKind::ServerError => true,
            ErrorKind::Unauthorized => false,
            ErrorKind::QuotaExceeded => false,
            ErrorKind::Unknown => attempt < self.config.unknown_max_attempts,
        }
    }

    /// Exponential backoff for the failed `attempt`, with jitter and cap
    pub fn backoff_delay(&self, attempt: u32, mode: RetryMode) -> Duration {
        let exponent = match mode {
            RetryMode::Auto => attempt.saturating_sub(1),
            // The exponent restarts after every extended wait
            RetryMode::Persistent => {
                attempt.saturating_sub(1) % self.config.persistent_reset_every.max(1)
            }
        };

        let multiplier = self.config.backoff_multiplier.powi(exponent.min(16) as i32);
        let delay = self.config.base_delay.as_secs_f64() * multiplier;

        let jitter = if self.config.jitter > 0.0 {
            (rand::random::<f64>() - 0.5) * 2.0 * self.config.jitter
        } else {
            0.0
        };
        let jittered = (delay * (1.0 + jitter)).max(0.0);

        Duration::from_secs_f64(jittered.min(self.config.max_backoff_delay.as_secs_f64()))
    }

    /// Delay before retrying after a failure of `kind`.
    ///
    /// `rotated` tells whether another credential is usable right now; a
    /// rate-limited call then moves on almost immediately.
    pub fn recovery_delay(
        &self,
        kind: ErrorKind,
        attempt: u32,
        mode: RetryMode,
        hint: Option<Duration>,
        rotated: bool,
    ) -> Duration {
        if mode == RetryMode::Persistent
            && attempt % self.config.persistent_reset_every.max(1) == 0
        {
            return self.config.extended_wait.max(hint.unwrap_or_default());
        }

        match kind {
            ErrorKind::RateLimited if rotated => self.config.rotation_delay * attempt,
            ErrorKind::RateLimited => self
                .backoff_delay(attempt, mode)
                .max(hint.unwrap_or_default()),
            _ => self.backoff_delay(attempt, mode),
        }
    }
}

/// Error counters kept by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct ErrorStatistics {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_errors: u64,
    pub last_error_time: Option<DateTime<Utc>>,
    pub error_types: HashMap<String, u32>,
}

impl ErrorStatistics {
    pub fn record_success(&mut self) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    pub fn record_error(&mut self, kind: ErrorKind) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.total_errors += 1;
        self.last_error_time = Some(Utc::now());
        *self.error_types.entry(kind.as_str().to_string()).or_insert(0) += 1;
    }
}

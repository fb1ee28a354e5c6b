//! One logical generation call.
//!
//! `CacheCheck -> ThrottleWait -> CredentialSelect -> Calling -> (Success | Classify)`,
//! repeated by an iterative loop until the call succeeds, a fatal class is hit or
//! the retry budget of the [`RetryMode`] runs out.

use crate::gateway::cache::ResponseCache;
use crate::gateway::credential_pool::{CredentialPool, CredentialSelection};
use crate::gateway::error_recovery::{
    ErrorStatistics, RetryPolicy, classify, redact, retry_hint,
};
use crate::gateway::throttle::{ConcurrencyThrottle, Outcome};
use crate::gateway::types::{ErrorKind, GatewayError, RetryMode, Task};
use crate::provider::{GenerationOutput, GenerationProvider};
use chrono::Utc;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct InvocationOrchestrator {
    provider: Arc<dyn GenerationProvider>,
    pool: Arc<CredentialPool>,
    cache: Arc<ResponseCache>,
    throttle: Arc<ConcurrencyThrottle>,
    policy: RetryPolicy,
    statistics: Mutex<ErrorStatistics>,
}

impl InvocationOrchestrator {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        pool: Arc<CredentialPool>,
        cache: Arc<ResponseCache>,
        throttle: Arc<ConcurrencyThrottle>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            pool,
            cache,
            throttle,
            policy,
            statistics: Mutex::new(ErrorStatistics::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn statistics(&self) -> ErrorStatistics {
        self.statistics.lock().await.clone()
    }

    /// Run `task` to completion or to a classified failure
    pub async fn invoke(
        &self,
        task: &Task,
        mode: RetryMode,
    ) -> Result<GenerationOutput, GatewayError> {
        if task.payload.content.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "task {} has empty content",
                task.id
            )));
        }

        if let Some(output) = self.cache.get(&task.payload).await {
            debug!("Task {} served from cache", task.id);
            return Ok(output);
        }

        let max_attempts = self.policy.max_attempts(mode);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let permit = self.throttle.acquire().await?;
            let lease = match self.pool.select_usable().await {
                CredentialSelection::Ready(lease) => lease,
                CredentialSelection::AllCooling { lease, available_at } => {
                    // The slot is not held while waiting for a cooldown
                    drop(permit);
                    if attempt >= max_attempts {
                        return Err(GatewayError::RateLimited {
                            message: format!(
                                "all credentials are cooling down, credential {} is free first",
                                lease.id
                            ),
                            attempts: attempt,
                            retry_at: Some(available_at),
                        });
                    }

                    let wait = (available_at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(self.policy.max_delay());
                    info!(
                        "All credentials cooling down, task {} waits {:?} (attempt {}/{})",
                        task.id, wait, attempt, max_attempts
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                CredentialSelection::Empty => return Err(GatewayError::NoCredentials),
            };

            debug!(
                "Task {} attempt {}/{} with credential {}",
                task.id, attempt, max_attempts, lease.id
            );
            let result = self.provider.generate(&task.payload, &lease.secret).await;

            let error = match result {
                Ok(output) => {
                    self.throttle.release(permit, Outcome::Success).await;
                    self.pool.record_success(&lease.id).await;
                    self.cache.put(&task.payload, output.clone()).await;
                    self.statistics.lock().await.record_success();

                    info!(
                        "Task {} completed after {} attempt(s) in {:?}",
                        task.id,
                        attempt,
                        started.elapsed()
                    );
                    return Ok(output);
                }
                Err(error) => {
                    self.throttle.release(permit, Outcome::Failure).await;
                    error
                }
            };

            let kind = classify(&error);
            let hint = retry_hint(&error);
            let message = redact(&error.to_string(), &[lease.secret.expose_secret()]);
            self.statistics.lock().await.record_error(kind);
            warn!(
                "Task {} attempt {}/{} failed ({}): {}",
                task.id,
                attempt,
                max_attempts,
                kind.as_str(),
                message
            );

            match kind {
                ErrorKind::RateLimited => {
                    self.pool.record_rate_limit(&lease.id, hint).await;
                }
                ErrorKind::Unauthorized => {
                    self.pool.record_unauthorized(&lease.id).await;
                }
                _ => {}
            }

            if !self.policy.should_retry(kind, attempt, mode) {
                let mut failure = GatewayError::classified(kind, message, attempt);
                if let GatewayError::RateLimited { retry_at, .. } = &mut failure {
                    *retry_at = self.pool.status().await.next_available_at;
                }
                return Err(failure);
            }

            let rotated = kind == ErrorKind::RateLimited && self.pool.has_usable().await;
            let delay = self.policy.recovery_delay(kind, attempt, mode, hint, rotated);
            debug!("Task {} retrying in {:?}", task.id, delay);
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for InvocationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationOrchestrator")
            .field("provider", &self.provider.provider_name())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

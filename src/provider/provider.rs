use crate::provider::types::{GenerationOutput, GenerationRequest, ProviderError};
use futures::future::BoxFuture;
use secrecy::SecretString;

/// Remote generation service that can be called with any credential of the pool
pub trait GenerationProvider: Send + Sync {
    /// Execute a single generation call
    ///
    /// # Arguments
    /// * `request` - What to generate
    /// * `credential` - The credential selected by the pool for this attempt
    ///
    /// Implementations must not retry internally: classification, rotation and
    /// backoff are owned by the orchestrator.
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
        credential: &'a SecretString,
    ) -> BoxFuture<'a, Result<GenerationOutput, ProviderError>>;

    /// Get provider name/identifier
    fn provider_name(&self) -> &'static str;

    /// Clean up resources
    fn shutdown(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async { Ok(()) })
    }
}

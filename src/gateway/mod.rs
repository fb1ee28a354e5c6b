pub mod types;
pub mod usage_store;
pub mod credential_pool;
pub mod cache;
pub mod throttle;
pub mod error_recovery;
pub mod orchestrator;
pub mod segmenter;
pub mod service;


pub use types::*;
pub use cache::{
    CacheStats, CompactionReport, FileCacheStore, PersistentCacheStore, ResponseCache,
};
pub use credential_pool::{
    CredentialPool, CredentialSelection, CredentialSlot, PoolError, Subscription,
};
pub use error_recovery::{ErrorStatistics, RetryPolicy};
pub use orchestrator::InvocationOrchestrator;
pub use segmenter::{ReassembledOutput, ReassemblyPolicy, Segmenter};
pub use service::GenerationGateway;
pub use throttle::{ConcurrencyThrottle, Outcome, ThrottleStatus};
pub use usage_store::{JsonFileUsageStore, UsageStore};

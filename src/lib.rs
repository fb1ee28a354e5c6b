//! # Gengate
//!
//! A generation gateway that delivers text and speech generation requests to a
//! rate-limited remote provider through a pool of API credentials.
//!
//! ## Architecture Overview
//!
//! - **[`provider`]**: Provider-agnostic request and output types, plus the HTTP provider
//! - **[`gateway`]**: Credential pool, response cache, concurrency throttle, error
//!   recovery, segmentation and the [`GenerationGateway`] service tying them together
//! - **[`cli`]**: Argument parsing, configuration discovery and task file loading
//! - **[`env`]**: Paths, file names and environment variables shared across modules
//!
//! ## Request lifecycle
//!
//! A submitted [`Task`] is answered from the two-tier cache when possible. Otherwise a
//! usable credential is picked round-robin, a throttle permit is taken, and the
//! provider is called. Failures are classified; rate-limited credentials cool down
//! and the call rotates to the next one, network and server failures back off
//! exponentially, and rejected credentials are disabled. Long content is split into
//! chunks that run in parallel and are reassembled in order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gengate::{GatewayConfig, GenerationGateway, GenerationRequest, HttpProvider, Task};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = GatewayConfig::default();
//!     config.pool.credentials = vec!["my-api-key-0123456789".to_string()];
//!
//!     let provider = HttpProvider::new(config.provider.clone())?;
//!     let gateway = GenerationGateway::init(config, Arc::new(provider)).await?;
//!
//!     let output = gateway
//!         .submit(Task::new("greeting", GenerationRequest::text("Say hello")))
//!         .await?;
//!     println!("{}", output.as_text().unwrap_or_default());
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Provider-agnostic generation interface.
///
/// Request/output types shared by every layer and the HTTP implementation of
/// [`provider::GenerationProvider`].
pub mod provider;

/// Resilient delivery of generation requests.
///
/// Credential rotation with cooldowns, caching, adaptive throttling, classified
/// retries and content segmentation.
pub mod gateway;

/// Environment configuration and constants
pub mod env;

/// Command line interface
pub mod cli;

pub use gateway::{
    GatewayConfig, GatewayError, GenerationGateway, PoolStatus, ReassemblyPolicy, RetryMode,
    Task,
};
pub use provider::{
    GenerationKind, GenerationOutput, GenerationProvider, GenerationRequest, HttpProvider,
    ProviderError,
};

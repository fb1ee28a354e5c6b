//! CLI-specific functionality for the generation gateway
//!
//! This module contains all CLI-related code including argument parsing,
//! task file loading, and configuration discovery.

pub mod args;
pub mod config;
pub mod tasks;

pub use args::{Args, BatchConfig, ContentSource, ExecutionMode, GenerateConfig};
pub use config::ConfigDiscovery;
pub use tasks::{FileError, TaskLoader};

//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./gengate.toml or ./.gengate/config.toml
//! 2. User config: ~/.gengate/config.toml
//! 3. System config: /etc/gengate/config.toml
//! 4. Built-in defaults
//!
//! Credentials from `GENGATE_API_KEYS` are appended to whatever the file lists.

use crate::env;
use crate::gateway::GatewayConfig;
use anyhow::Context;
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

impl GatewayConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: GatewayConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save to TOML file. Credentials are never written.
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Append credentials not already present
    pub fn merge_credentials<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        for key in keys {
            if !self.pool.credentials.contains(&key) {
                self.pool.credentials.push(key);
            }
        }
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the explicit file when given, otherwise walk the hierarchy
    pub fn load(config_override: Option<&Path>) -> anyhow::Result<GatewayConfig> {
        let mut config = match config_override {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                GatewayConfig::from_toml_file(path)?
            }
            None => Self::discover_config()?,
        };

        let env_keys = env::api_keys_from_env();
        if !env_keys.is_empty() {
            debug!(
                "Adding {} credential(s) from {}",
                env_keys.len(),
                env::vars::API_KEYS
            );
        }
        config.merge_credentials(env_keys);
        Ok(config)
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> anyhow::Result<GatewayConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return GatewayConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(GatewayConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::get_config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = env::home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/gengate/config.toml"));

        #[cfg(windows)]
        if let Ok(program_data) = std_env::var("PROGRAMDATA") {
            candidates.push(
                PathBuf::from(program_data)
                    .join("gengate")
                    .join(env::CONFIG_FILE_NAME),
            );
        }

        candidates
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config() -> anyhow::Result<PathBuf> {
        let home_dir = env::home_dir().context("could not determine home directory")?;

        let config_dir = env::user_config_dir_path(&home_dir);
        let config_path = env::user_config_file_path(&home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).with_context(|| {
                format!("failed to create config directory {}", config_dir.display())
            })?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if !config_path.exists() {
            GatewayConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        } else {
            warn!("Configuration file already exists: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }

        let env_keys = env::api_keys_from_env();
        println!(
            "Credentials from {}: {}",
            env::vars::API_KEYS,
            env_keys.len()
        );
        println!("Data directory: {:?}", env::default_data_dir());
    }
}

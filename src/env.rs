//! Environment constants and path utilities for the generation gateway.
//!
//! This module centralizes all hardcoded paths, file names and environment
//! variable names used throughout the crate.

use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const GENGATE_DIR_NAME: &str = ".gengate";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name when placed directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "gengate.toml";

/// Environment variables read by the gateway
pub mod vars {
    /// Comma-separated list of provider credentials
    pub const API_KEYS: &str = "GENGATE_API_KEYS";

    /// Overrides the data directory (cache and usage records)
    pub const DATA_DIR: &str = "GENGATE_DATA_DIR";
}

/// Persistent state directory and file names
pub mod store {
    /// Persistent response cache directory name
    pub const CACHE_DIR_NAME: &str = "cache";

    /// Credential usage and cooldown records
    pub const USAGE_FILE_NAME: &str = "credential_usage.json";
}

/// Test-related constants
pub mod test {
    /// Credential that satisfies the default format check
    pub const VALID_TEST_KEY: &str = "test-key-aaaaaaaaaaaaaaaa";

    /// Second credential that satisfies the default format check
    pub const OTHER_TEST_KEY: &str = "test-key-bbbbbbbbbbbbbbbb";
}

/// Build the main .gengate directory path from a root directory
pub fn gengate_dir_path(root: &Path) -> PathBuf {
    root.join(GENGATE_DIR_NAME)
}

/// Build the persistent cache directory path
pub fn cache_dir_path(data_dir: &Path) -> PathBuf {
    data_dir.join(store::CACHE_DIR_NAME)
}

/// Build the credential usage file path
pub fn usage_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(store::USAGE_FILE_NAME)
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    gengate_dir_path(home_dir)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    gengate_dir_path(current_dir).join(CONFIG_FILE_NAME)
}

/// Resolve the data directory: explicit override, `GENGATE_DATA_DIR`, then `~/.gengate`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(vars::DATA_DIR)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    home_dir()
        .map(|home| gengate_dir_path(&home))
        .unwrap_or_else(|| PathBuf::from(GENGATE_DIR_NAME))
}

/// Get home directory path
pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .map(PathBuf::from)
}

/// Read credentials from `GENGATE_API_KEYS`, skipping blanks.
pub fn api_keys_from_env() -> Vec<String> {
    std::env::var(vars::API_KEYS)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_path_construction() {
        let data_dir = Path::new("/home/user/.gengate");

        assert_eq!(
            cache_dir_path(data_dir),
            Path::new("/home/user/.gengate/cache")
        );
        assert_eq!(
            usage_file_path(data_dir),
            Path::new("/home/user/.gengate/credential_usage.json")
        );
    }

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        let current_dir = Path::new("/current/project");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.gengate/config.toml")
        );

        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/.gengate/config.toml")
        );
    }

    #[test]
    #[serial]
    fn test_api_keys_from_env() {
        unsafe { std::env::set_var(vars::API_KEYS, " key-one , ,key-two") };
        assert_eq!(api_keys_from_env(), vec!["key-one", "key-two"]);

        unsafe { std::env::remove_var(vars::API_KEYS) };
        assert!(api_keys_from_env().is_empty());
    }

    #[test]
    #[serial]
    fn test_data_dir_override() {
        unsafe { std::env::set_var(vars::DATA_DIR, "/tmp/gengate-data") };
        assert_eq!(default_data_dir(), PathBuf::from("/tmp/gengate-data"));
        unsafe { std::env::remove_var(vars::DATA_DIR) };
    }
}

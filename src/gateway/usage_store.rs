//! Durable credential usage records.
//!
//! Records are keyed by the credential id (a truncated SHA-256 of the secret), so
//! the file never contains the secret itself.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs as async_fs;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub credential_hash: String,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Quota period (UTC day) the counters belong to
    pub period: Option<NaiveDate>,
    pub records: Vec<UsageRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum UsageStoreError {
    #[error("usage store io failed: {0:#}")]
    Io(anyhow::Error),
    #[error("usage store contents are invalid: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn load(&self) -> Result<UsageSnapshot, UsageStoreError>;
    async fn save(&self, snapshot: &UsageSnapshot) -> Result<(), UsageStoreError>;
}

/// JSON file store with atomic replace-on-write
#[derive(Debug, Clone)]
pub struct JsonFileUsageStore {
    path: PathBuf,
}

impl JsonFileUsageStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl UsageStore for JsonFileUsageStore {
    async fn load(&self) -> Result<UsageSnapshot, UsageStoreError> {
        if !async_fs::try_exists(&self.path).await.unwrap_or(false) {
            debug!("No usage file at {:?}, starting fresh", self.path);
            return Ok(UsageSnapshot::default());
        }

        let content = async_fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read usage file: {}", self.path.display()))
            .map_err(UsageStoreError::Io)?;

        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, snapshot: &UsageSnapshot) -> Result<(), UsageStoreError> {
        let content = serde_json::to_string_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))
                .map_err(UsageStoreError::Io)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        async_fs::write(&temp_path, content)
            .await
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))
            .map_err(UsageStoreError::Io)?;
        async_fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace usage file: {}", self.path.display()))
            .map_err(UsageStoreError::Io)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_loads_empty_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileUsageStore::new(temp_dir.path().join("usage.json"));

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot, UsageSnapshot::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileUsageStore::new(temp_dir.path().join("nested").join("usage.json"));

        let snapshot = UsageSnapshot {
            period: Some(Utc::now().date_naive()),
            records: vec![UsageRecord {
                credential_hash: "abc123".to_string(),
                usage_count: 7,
                last_used: Some(Utc::now()),
                cooldown_until: None,
                disabled: false,
            }],
        };

        store.save(&snapshot).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_reports_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("usage.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileUsageStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(UsageStoreError::Corrupt(_))
        ));
    }
}

//! Engine configuration storage
//!
//! The same document is read from disk by the controller and shipped to
//! workers inside `start`/`init` messages, so every field is defaulted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;

/// Single source of truth for configuration defaults
pub mod defaults {
    /// Vault document location
    pub const VAULT_PATH: &str = "vault.json";
    /// Whether a node error event stops the flow
    pub const STOP_ON_ERROR: bool = true;
    /// How long an error tracker stays visible
    pub const ERROR_STATUS_TIMEOUT_MS: u64 = 7000;
    /// Worker executable launched by the controller
    pub const WORKER_PROGRAM: &str = "flow-worker";
    /// Status relay batching period
    pub const STATUS_BATCH_INTERVAL_MS: u64 = 100;
}

/// Secret vault settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultConfig {
    pub path: PathBuf,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::VAULT_PATH),
        }
    }
}

/// Flow runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowConfig {
    pub stop_on_error: bool,
    pub error_status_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            stop_on_error: defaults::STOP_ON_ERROR,
            error_status_timeout_ms: defaults::ERROR_STATUS_TIMEOUT_MS,
        }
    }
}

/// Worker process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// Path or name of the worker executable
    pub program: PathBuf,
    pub status_batch_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(defaults::WORKER_PROGRAM),
            status_batch_interval_ms: defaults::STATUS_BATCH_INTERVAL_MS,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub vault: VaultConfig,
    pub flows: FlowConfig,
    pub worker: WorkerConfig,
}

impl EngineConfig {
    /// Load configuration from a JSON file; a missing file yields defaults
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No configuration at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save configuration to disk as pretty JSON
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents).await?;

        log::info!("Configuration saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "flows": { "stopOnError": false } }"#).unwrap();
        assert!(!config.flows.stop_on_error);
        assert_eq!(config.flows.error_status_timeout_ms, 7000);
        assert_eq!(config.vault.path, PathBuf::from("vault.json"));
        assert_eq!(config.worker.status_batch_interval_ms, 100);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = tokio_test::block_on(EngineConfig::load(dir.path().join("absent.json"))).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("engine.json");

        let mut config = EngineConfig::default();
        config.vault.path = dir.path().join("secrets.json");
        config.worker.program = PathBuf::from("/usr/local/bin/flow-worker");
        config.save(&path).await.unwrap();

        let loaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("statusBatchIntervalMs"));
    }
}

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{SyncError, SyncResult};

/// Configuration of the per-runtime storage worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of concurrent outbound diff fetches.
    #[serde(default = "default_fetch_pool_size")]
    pub fetch_pool_size: usize,
    /// Attempt an initial sync from peer checkpoints before falling back
    /// to incremental diffs.
    #[serde(default = "default_true")]
    pub checkpoint_sync_enabled: bool,
    /// Chunk size, in bytes, used when producing checkpoints locally.
    #[serde(default = "default_checkpoint_chunk_size")]
    pub checkpoint_chunk_size: usize,
}

fn default_fetch_pool_size() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_chunk_size() -> usize {
    1 << 20
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_pool_size: default_fetch_pool_size(),
            checkpoint_sync_enabled: true,
            checkpoint_chunk_size: default_checkpoint_chunk_size(),
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| SyncError::Config(format!("unable to read config: {err}")))?;
        let config: WorkerConfig = toml::from_str(&content)
            .map_err(|err| SyncError::Config(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|err| SyncError::Config(format!("unable to create config dir: {err}")))?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| SyncError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)
            .map_err(|err| SyncError::Config(format!("unable to write config: {err}")))?;
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.fetch_pool_size == 0 {
            return Err(SyncError::Config(
                "fetch_pool_size must be at least one".into(),
            ));
        }
        if self.checkpoint_chunk_size == 0 {
            return Err(SyncError::Config(
                "checkpoint_chunk_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        WorkerConfig::default().validate().expect("valid defaults");
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("worker.toml");
        let config = WorkerConfig {
            fetch_pool_size: 8,
            checkpoint_sync_enabled: false,
            checkpoint_chunk_size: 4096,
        };
        config.save(&path).expect("save");
        let loaded = WorkerConfig::load(&path).expect("load");
        assert_eq!(loaded.fetch_pool_size, 8);
        assert!(!loaded.checkpoint_sync_enabled);
        assert_eq!(loaded.checkpoint_chunk_size, 4096);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let config = WorkerConfig {
            fetch_pool_size: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

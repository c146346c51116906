use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::MIB;

const MIN_PURGE_TARGET_MIB: u64 = 128;
const PURGE_HEADROOM_MIB: u64 = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub workers: WorkerConfig,
    pub resample: ResampleConfig,
    pub index: IndexConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_cache_mib: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_mib: 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub stream_threads: usize,
    pub resample_threads: usize,
    pub large_threshold_kib: u64,
    pub decompress_slots: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stream_threads: 2,
            resample_threads: 2,
            large_threshold_kib: 128,
            decompress_slots: 2,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResampleConfig {
    pub enabled: bool,
    /// Hex fingerprints that are never resampled (logos and the like).
    pub blacklist: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub root: PathBuf,
    pub extension: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("inject_res"),
            extension: "png".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if config.index.root.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.index.root = base.join(&config.index.root);
        }
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.stream_threads == 0 {
            return Err(ConfigError::Invalid(
                "workers.stream_threads must be at least 1".to_string(),
            ));
        }
        if self.workers.resample_threads == 0 {
            return Err(ConfigError::Invalid(
                "workers.resample_threads must be at least 1".to_string(),
            ));
        }
        if self.workers.decompress_slots == 0 {
            return Err(ConfigError::Invalid(
                "workers.decompress_slots must be at least 1".to_string(),
            ));
        }
        if self.index.extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::Invalid("index.extension is empty".to_string()));
        }
        Ok(())
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.cache.max_cache_mib.saturating_mul(MIB)
    }

    /// Limit minus headroom, never below 128 MiB.
    pub fn purge_target_bytes(&self) -> u64 {
        MIN_PURGE_TARGET_MIB
            .max(self.cache.max_cache_mib.saturating_sub(PURGE_HEADROOM_MIB))
            .saturating_mul(MIB)
    }

    pub fn large_threshold_bytes(&self) -> u64 {
        self.workers.large_threshold_kib.saturating_mul(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").expect("parse");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_cache_mib, 1024);
        assert_eq!(config.workers.large_threshold_kib, 128);
        assert_eq!(config.index.extension, "png");
    }

    #[test]
    fn partial_tables_fill_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
[cache]
max_cache_mib = 512

[resample]
enabled = true
blacklist = ["fa3d03df"]
"#,
        )
        .expect("parse");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_cache_mib, 512);
        assert!(config.resample.enabled);
        assert_eq!(config.resample.blacklist, vec!["fa3d03df".to_string()]);
        assert_eq!(config.workers.stream_threads, 2);
    }

    #[test]
    fn zero_threads_rejected() {
        let err = EngineConfig::from_toml_str("[workers]\nstream_threads = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn purge_target_keeps_headroom() {
        let mut config = EngineConfig::default();
        config.cache.max_cache_mib = 1024;
        assert_eq!(config.purge_target_bytes(), 960 * MIB);
        config.cache.max_cache_mib = 150;
        assert_eq!(config.purge_target_bytes(), 128 * MIB);
        config.cache.max_cache_mib = 16;
        assert_eq!(config.purge_target_bytes(), 128 * MIB);
    }
}

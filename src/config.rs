//! Store configuration.

use crate::partition::Codec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a feature store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store root. Partition data lives under `<root>/partitions`, index
    /// files under `<root>/index`.
    pub root: PathBuf,

    /// Codec for newly written partitions.
    /// Default: zstd (fast decode beats maximum ratio on the query path).
    #[serde(default)]
    pub codec: Codec,

    /// Compression level passed to the codec.
    /// Default: 3 (balanced speed/ratio)
    pub compression_level: i32,

    /// Compressed/uncompressed ratio the store is expected to stay under.
    /// Default: 0.5
    pub target_ratio: f64,

    /// Maximum cached query results.
    /// Default: 1024
    pub cache_capacity: usize,

    /// Cache entry time-to-live in seconds.
    /// Default: 300
    pub cache_ttl_secs: u64,

    /// Worker threads for multi-partition scans.
    /// Default: 4
    pub scan_threads: usize,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.root.join("partitions")
    }

    pub fn index_root(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("feature_store"),
            codec: Codec::Zstd,
            compression_level: 3,
            target_ratio: 0.5,
            cache_capacity: 1024,
            cache_ttl_secs: 300,
            scan_threads: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.codec, Codec::Zstd);
        assert_eq!(config.compression_level, 3);
        assert_eq!(config.target_ratio, 0.5);
        assert_eq!(config.cache_capacity, 1024);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.scan_threads, 4);
    }

    #[test]
    fn test_config_paths() {
        let config = StoreConfig::new("/data/fs");
        assert_eq!(config.storage_root(), PathBuf::from("/data/fs/partitions"));
        assert_eq!(config.index_root(), PathBuf::from("/data/fs/index"));
    }

    #[test]
    fn test_config_serialization() {
        let config = StoreConfig::new("/data/fs");
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.root, deserialized.root);
        assert_eq!(config.codec, deserialized.codec);
        assert_eq!(config.cache_ttl_secs, deserialized.cache_ttl_secs);
    }
}

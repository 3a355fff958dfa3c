//! Partition manifests.
//!
//! The manifest is the pointer readers follow to the current data file.
//! Replacing it is the commit point of a write: the new data file is
//! published first, then the manifest is swapped via tmp + fsync + rename,
//! so a crash at any point leaves either the old or the new version fully
//! intact.

use crate::error::{Error, Result};
use crate::partition::{Codec, PartitionId};
use crate::record::now_ns;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PartitionManifest {
    /// Manifest format version.
    pub version: u32,
    pub partition: PartitionId,
    /// Current data file name within the partition directory.
    pub data_file: String,
    /// Monotonic per-partition version counter; each rewrite increments it.
    pub sequence: u64,
    pub record_count: u64,
    /// Column list of the current block.
    pub columns: Vec<String>,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    /// CRC32 of the uncompressed payload, mirrored from the block header.
    pub checksum: u32,
    pub codec: Codec,
    pub created_at_ns: u64,
}

impl PartitionManifest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition: PartitionId,
        data_file: String,
        sequence: u64,
        record_count: u64,
        columns: Vec<String>,
        uncompressed_bytes: u64,
        compressed_bytes: u64,
        checksum: u32,
        codec: Codec,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            partition,
            data_file,
            sequence,
            record_count,
            columns,
            uncompressed_bytes,
            compressed_bytes,
            checksum,
            codec,
            created_at_ns: now_ns(),
        }
    }

    /// Compressed-to-uncompressed size ratio of the current block.
    pub fn ratio(&self) -> f64 {
        if self.uncompressed_bytes == 0 {
            return 0.0;
        }
        self.compressed_bytes as f64 / self.uncompressed_bytes as f64
    }

    /// Atomically save to `partition_dir/manifest.json`.
    pub fn save(&self, partition_dir: &Path) -> Result<()> {
        let manifest_path = partition_dir.join(MANIFEST_FILENAME);
        let tmp = manifest_path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        std::fs::rename(tmp, manifest_path)?;
        Ok(())
    }

    pub fn load(partition_dir: &Path) -> Result<Self> {
        let manifest_path = partition_dir.join(MANIFEST_FILENAME);
        let json = std::fs::read_to_string(&manifest_path)?;
        let manifest: PartitionManifest = serde_json::from_str(&json).map_err(|e| {
            Error::CorruptManifest(format!("{}: {}", manifest_path.display(), e))
        })?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::UnsupportedVersion(manifest.version));
        }
        Ok(manifest)
    }

    pub fn exists(partition_dir: &Path) -> bool {
        partition_dir.join(MANIFEST_FILENAME).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::date;

    fn sample_manifest() -> PartitionManifest {
        PartitionManifest::new(
            PartitionId::for_visit("adni", date!(2024 - 03 - 15)),
            "000000000001.fsp".to_string(),
            1,
            42,
            vec!["mmse_score".to_string()],
            1000,
            400,
            0xdead_beef,
            Codec::Zstd,
        )
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let manifest = sample_manifest();
        manifest.save(dir.path()).unwrap();

        let loaded = PartitionManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.version, MANIFEST_VERSION);
        assert_eq!(loaded.partition, manifest.partition);
        assert_eq!(loaded.data_file, manifest.data_file);
        assert_eq!(loaded.sequence, 1);
        assert_eq!(loaded.record_count, 42);
        assert_eq!(loaded.checksum, 0xdead_beef);
        assert_eq!(loaded.codec, Codec::Zstd);
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        assert!(PartitionManifest::load(dir.path()).is_err());
        assert!(!PartitionManifest::exists(dir.path()));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILENAME), b"not json").unwrap();
        assert!(matches!(
            PartitionManifest::load(dir.path()),
            Err(Error::CorruptManifest(_))
        ));
    }

    #[test]
    fn test_save_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        sample_manifest().save(dir.path()).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_ratio() {
        let manifest = sample_manifest();
        assert!((manifest.ratio() - 0.4).abs() < f64::EPSILON);
    }
}

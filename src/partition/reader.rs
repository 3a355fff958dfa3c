//! Read path for a single partition.

use crate::error::{Error, Result};
use crate::partition::block::unframe_block;
use crate::partition::{decode_block, PartitionId, PartitionManifest};
use crate::record::FeatureRecord;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Reader over one partition's current data file.
///
/// Opening the reader pins a version: the manifest is read once and the data
/// file it references is mapped immediately, so a concurrent writer swapping
/// in a new version does not affect reads in flight.
pub struct PartitionReader {
    manifest: PartitionManifest,
    map: Mmap,
}

impl PartitionReader {
    /// Open the partition rooted at `storage_root` for `id`.
    ///
    /// A concurrent writer may swap the manifest and remove the superseded
    /// data file between the manifest load and the map. The file named by
    /// the current manifest always exists, so a missing file means the
    /// manifest just went stale: reload and try again.
    pub fn open(storage_root: &Path, id: &PartitionId) -> Result<Self> {
        let dir = id.dir(storage_root);
        let mut last_err = None;
        for _ in 0..8 {
            let manifest = PartitionManifest::load(&dir)?;
            let data_path = dir.join(&manifest.data_file);
            match map_file(&data_path, id) {
                Ok(map) => return Ok(Self { manifest, map }),
                Err(err @ Error::PartitionIo { .. }) if !data_path.exists() => {
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(Error::Corrupt("partition data file unreadable")))
    }

    pub fn manifest(&self) -> &PartitionManifest {
        &self.manifest
    }

    /// Decode records, optionally projecting to a feature-column subset.
    /// Key columns always decode. The payload checksum is verified before
    /// any record is produced.
    pub fn read(&self, projection: Option<&[String]>) -> Result<Vec<FeatureRecord>> {
        let (_, payload) = unframe_block(&self.map)?;
        decode_block(&payload, projection)
    }

    /// Decode only the key columns. Used by index rebuild.
    pub fn read_keys(&self) -> Result<Vec<FeatureRecord>> {
        self.read(Some(&[]))
    }

    /// The verified, uncompressed columnar payload. Used by the compression
    /// advisor's codec trials.
    pub fn read_payload(&self) -> Result<Vec<u8>> {
        let (_, payload) = unframe_block(&self.map)?;
        Ok(payload)
    }
}

fn map_file(path: &PathBuf, id: &PartitionId) -> Result<Mmap> {
    let file = File::open(path).map_err(|source| Error::PartitionIo {
        partition: id.to_string(),
        source,
    })?;
    // Safety: the mapped file is immutable once published; writers only
    // ever create new files and swap the manifest pointer.
    unsafe { Mmap::map(&file) }.map_err(|source| Error::PartitionIo {
        partition: id.to_string(),
        source,
    })
}

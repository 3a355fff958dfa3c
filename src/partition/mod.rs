//! Partitioned columnar storage.
//!
//! A partition is the unit of on-disk storage, keyed by
//! `(cohort, year, month)` of the records' visit dates. Each partition
//! leaf directory holds one current versioned data file plus a
//! `manifest.json`; the data file is immutable once published and is
//! superseded, never edited, on update.

mod block;
mod codec;
mod manifest;
mod reader;
mod writer;

pub use block::{decode_block, encode_block, BLOCK_MAGIC, BLOCK_VERSION};
pub use codec::Codec;
pub use manifest::{PartitionManifest, MANIFEST_FILENAME, MANIFEST_VERSION};
pub use reader::PartitionReader;
pub use writer::{PartitionWriter, RejectedRecord, WriteReport};

use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use time::Date;

/// Identity of a partition: the cohort plus the year and month of the
/// records' visit dates. Deterministically computed, never chosen.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PartitionId {
    pub cohort: String,
    pub year: i32,
    pub month: u8,
}

impl PartitionId {
    /// Partition a record's visit date falls into.
    pub fn for_visit(cohort: &str, visit_date: Date) -> Self {
        Self {
            cohort: cohort.to_string(),
            year: visit_date.year(),
            month: u8::from(visit_date.month()),
        }
    }

    /// `"yyyy-mm"` month key used by the date index.
    pub fn month_key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Hive-style partition directory relative to the storage root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "cohort={}/year={:04}/month={:02}",
            self.cohort, self.year, self.month
        ))
    }

    /// Absolute partition directory under `root`.
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }

    /// Parse from a Hive-style relative path.
    pub fn from_relative_path(path: &Path) -> Result<Self> {
        let mut cohort = None;
        let mut year = None;
        let mut month = None;
        for part in path.iter() {
            let part = part.to_string_lossy();
            let Some((key, value)) = part.split_once('=') else {
                return Err(Error::CorruptManifest(format!(
                    "invalid partition path segment: '{}'",
                    part
                )));
            };
            match key {
                "cohort" => cohort = Some(value.to_string()),
                "year" => year = value.parse::<i32>().ok(),
                "month" => month = value.parse::<u8>().ok(),
                _ => {
                    return Err(Error::CorruptManifest(format!(
                        "unknown partition key '{}'",
                        key
                    )))
                }
            }
        }
        match (cohort, year, month) {
            (Some(cohort), Some(year), Some(month @ 1..=12)) => Ok(Self {
                cohort,
                year,
                month,
            }),
            _ => Err(Error::CorruptManifest(format!(
                "incomplete partition path: '{}'",
                path.display()
            ))),
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:04}-{:02}", self.cohort, self.year, self.month)
    }
}

/// Data file name for a given sequence number, e.g. `000000000003.fsp`.
pub(crate) fn data_file_name(sequence: u64) -> String {
    format!("{:012}.fsp", sequence)
}

/// Discover every partition directory under `root` that carries a manifest.
pub fn discover_partitions(root: &Path) -> Result<Vec<PartitionId>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for cohort_entry in std::fs::read_dir(root)? {
        let cohort_dir = cohort_entry?.path();
        if !cohort_dir.is_dir() {
            continue;
        }
        for year_entry in std::fs::read_dir(&cohort_dir)? {
            let year_dir = year_entry?.path();
            if !year_dir.is_dir() {
                continue;
            }
            for month_entry in std::fs::read_dir(&year_dir)? {
                let month_dir = month_entry?.path();
                if !month_dir.is_dir() || !month_dir.join(MANIFEST_FILENAME).exists() {
                    continue;
                }
                let relative = month_dir
                    .strip_prefix(root)
                    .map_err(|_| Error::Corrupt("partition path outside storage root"))?;
                out.push(PartitionId::from_relative_path(relative)?);
            }
        }
    }
    out.sort();
    Ok(out)
}

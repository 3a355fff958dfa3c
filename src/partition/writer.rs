//! Write path: batch ingestion into immutable partition versions.
//!
//! Updates are realized by scan-and-rewrite: the current block is decoded,
//! merged with the incoming records by natural key, and re-encoded into a
//! new data file. The new file is published first, then the manifest is
//! atomically swapped, then the superseded file is removed. A failure at
//! any step leaves the prior version fully readable.

use crate::error::{Error, Result};
use crate::partition::block::{encode_block, frame_block, BLOCK_HEADER_LEN};
use crate::partition::{
    data_file_name, Codec, PartitionId, PartitionManifest, PartitionReader,
};
use crate::record::{now_ns, FeatureRecord};
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A record dropped at validation. Rejections are per-record; the rest of
/// the batch is still written.
#[derive(Debug, Clone)]
pub struct RejectedRecord {
    /// Position in the submitted batch.
    pub index: usize,
    pub patient_id: String,
    pub reason: String,
}

/// Outcome of a batch write.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    /// Records accepted and persisted (created + updated).
    pub written: usize,
    /// Accepted records whose natural key was new.
    pub created: usize,
    /// Accepted records that replaced a stored record with the same key.
    pub updated: usize,
    /// Total compressed payload bytes across the partitions touched.
    pub compressed_bytes: u64,
    pub rejected: Vec<RejectedRecord>,
}

/// Result of rewriting one partition.
#[derive(Debug, Clone)]
pub(crate) struct PartitionWriteOutcome {
    /// The partition's full record set after the merge, in natural-key order.
    pub records: Vec<FeatureRecord>,
    pub created: usize,
    pub updated: usize,
    pub compressed_bytes: u64,
}

pub struct PartitionWriter {
    root: PathBuf,
    codec: Codec,
    level: i32,
    /// Per-partition write locks. Writers to the same partition serialize
    /// here; writers to different partitions share nothing else.
    locks: Mutex<HashMap<PartitionId, Arc<Mutex<()>>>>,
}

impl PartitionWriter {
    pub fn new(root: impl Into<PathBuf>, codec: Codec, level: i32) -> Self {
        Self {
            root: root.into(),
            codec,
            level,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The write lock guarding `id`. Callers that need to extend the
    /// critical section past the data swap (e.g. through the index delta)
    /// acquire it here.
    pub(crate) fn partition_lock(&self, id: &PartitionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks.entry(id.clone()).or_default().clone()
    }

    /// Validate, group, and persist a batch. `cohort` fills in records whose
    /// own cohort is empty. Malformed records are reported in the returned
    /// report, never aborting the batch.
    pub fn write(&self, records: Vec<FeatureRecord>, cohort: Option<&str>) -> Result<WriteReport> {
        let (groups, mut report) = self.prepare_batch(records, cohort);
        for (id, incoming) in groups {
            let lock = self.partition_lock(&id);
            let _guard = lock.lock().expect("partition lock poisoned");
            let outcome = self.write_partition(&id, incoming)?;
            report.created += outcome.created;
            report.updated += outcome.updated;
            report.compressed_bytes += outcome.compressed_bytes;
        }
        report.written = report.created + report.updated;
        Ok(report)
    }

    /// Validation and grouping half of `write`, shared with the facade
    /// (which interleaves index updates inside the partition lock).
    pub(crate) fn prepare_batch(
        &self,
        records: Vec<FeatureRecord>,
        cohort: Option<&str>,
    ) -> (BTreeMap<PartitionId, Vec<FeatureRecord>>, WriteReport) {
        let mut groups: BTreeMap<PartitionId, Vec<FeatureRecord>> = BTreeMap::new();
        let mut report = WriteReport::default();
        let base_ns = now_ns();

        for (index, mut record) in records.into_iter().enumerate() {
            if record.cohort.is_empty() {
                if let Some(cohort) = cohort {
                    record.cohort = cohort.to_string();
                }
            }
            if let Err(err) = record.validate() {
                report.rejected.push(RejectedRecord {
                    index,
                    patient_id: record.patient_id.clone(),
                    reason: err.to_string(),
                });
                continue;
            }
            // Batch order breaks ties under last-write-wins.
            record.ingestion_timestamp = base_ns + index as u64;
            let id = PartitionId::for_visit(&record.cohort, record.visit_date);
            groups.entry(id).or_default().push(record);
        }

        (groups, report)
    }

    /// Merge `incoming` into the partition and publish a new version.
    /// The caller must hold the partition lock.
    pub(crate) fn write_partition(
        &self,
        id: &PartitionId,
        incoming: Vec<FeatureRecord>,
    ) -> Result<PartitionWriteOutcome> {
        let dir = id.dir(&self.root);
        std::fs::create_dir_all(&dir).map_err(|source| Error::PartitionIo {
            partition: id.to_string(),
            source,
        })?;

        let existing = if PartitionManifest::exists(&dir) {
            Some(PartitionManifest::load(&dir)?)
        } else {
            None
        };

        let mut merged: BTreeMap<(String, i32), FeatureRecord> = BTreeMap::new();
        if existing.is_some() {
            for record in PartitionReader::open(&self.root, id)?.read(None)? {
                let key = (record.patient_id.clone(), record.visit_date.to_julian_day());
                merged.insert(key, record);
            }
        }

        let mut created = 0;
        let mut updated = 0;
        for record in incoming {
            let key = (record.patient_id.clone(), record.visit_date.to_julian_day());
            let replace = match merged.get(&key) {
                None => {
                    created += 1;
                    true
                }
                Some(stored) if record.ingestion_timestamp >= stored.ingestion_timestamp => {
                    updated += 1;
                    true
                }
                Some(_) => {
                    // Stale write from a slower producer; the stored record
                    // is already newer under last-write-wins.
                    log::debug!("skipping stale record for {} in {}", record.patient_id, id);
                    false
                }
            };
            if replace {
                merged.insert(key, record);
            }
        }

        let records: Vec<FeatureRecord> = merged.into_values().collect();
        let compressed_bytes =
            self.publish(id, &dir, existing.as_ref(), &records, self.codec, self.level)?;

        Ok(PartitionWriteOutcome {
            records,
            created,
            updated,
            compressed_bytes,
        })
    }

    /// Re-encode a partition's existing records with a different codec.
    /// Record content is unchanged; only the data file version moves.
    pub(crate) fn rewrite_partition(
        &self,
        id: &PartitionId,
        codec: Codec,
        level: i32,
    ) -> Result<u64> {
        let dir = id.dir(&self.root);
        let existing = PartitionManifest::load(&dir)?;
        let records = PartitionReader::open(&self.root, id)?.read(None)?;
        self.publish(id, &dir, Some(&existing), &records, codec, level)
    }

    /// Encode, compress, publish the data file, swap the manifest, and drop
    /// the superseded file. Returns the compressed payload size.
    fn publish(
        &self,
        id: &PartitionId,
        dir: &std::path::Path,
        existing: Option<&PartitionManifest>,
        records: &[FeatureRecord],
        codec: Codec,
        level: i32,
    ) -> Result<u64> {
        let (payload, columns) = encode_block(records);
        let (framed, codec) = match frame_block(&payload, codec, level) {
            Ok(framed) => (framed, codec),
            Err(err) => {
                // Ingestion is never blocked on a codec failure.
                log::warn!(
                    "compression failed for {} ({}); writing uncompressed",
                    id,
                    err
                );
                (frame_block(&payload, Codec::None, 0)?, Codec::None)
            }
        };

        let sequence = existing.map(|m| m.sequence + 1).unwrap_or(0);
        let data_file = data_file_name(sequence);
        let final_path = dir.join(&data_file);
        let tmp_path = dir.join(format!("{}.tmp", data_file));
        let _ = std::fs::remove_file(&tmp_path);

        let io_err = |source: std::io::Error| Error::PartitionIo {
            partition: id.to_string(),
            source,
        };

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .map_err(io_err)?;
        file.write_all(&framed).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        std::fs::rename(&tmp_path, &final_path).map_err(io_err)?;

        let compressed_bytes = (framed.len() - BLOCK_HEADER_LEN) as u64;
        let manifest = PartitionManifest::new(
            id.clone(),
            data_file.clone(),
            sequence,
            records.len() as u64,
            columns,
            payload.len() as u64,
            compressed_bytes,
            crc32fast::hash(&payload),
            codec,
        );
        manifest.save(dir).map_err(|err| match err {
            Error::Io(source) => Error::PartitionIo {
                partition: id.to_string(),
                source,
            },
            other => other,
        })?;

        if let Some(old) = existing {
            if old.data_file != data_file {
                if let Err(err) = std::fs::remove_file(dir.join(&old.data_file)) {
                    log::warn!("failed to remove superseded file in {}: {}", id, err);
                }
            }
        }

        Ok(compressed_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::date;

    fn writer(dir: &TempDir) -> PartitionWriter {
        PartitionWriter::new(dir.path(), Codec::Zstd, 3)
    }

    fn record(patient: &str, date: time::Date, mmse: f64) -> FeatureRecord {
        FeatureRecord::new(patient, date, "adni").with_feature("mmse_score", mmse)
    }

    #[test]
    fn test_write_creates_partition() {
        let dir = TempDir::new().unwrap();
        let report = writer(&dir)
            .write(vec![record("P001", date!(2024 - 03 - 15), 27.0)], None)
            .unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 0);
        assert!(report.rejected.is_empty());
        assert!(report.compressed_bytes > 0);

        let id = PartitionId::for_visit("adni", date!(2024 - 03 - 15));
        assert!(PartitionManifest::exists(&id.dir(dir.path())));
    }

    #[test]
    fn test_duplicate_key_replaces() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer
            .write(vec![record("P001", date!(2024 - 03 - 15), 27.0)], None)
            .unwrap();
        let report = writer
            .write(vec![record("P001", date!(2024 - 03 - 15), 24.0)], None)
            .unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 1);

        let id = PartitionId::for_visit("adni", date!(2024 - 03 - 15));
        let reader = PartitionReader::open(dir.path(), &id).unwrap();
        assert_eq!(reader.manifest().record_count, 1);
        let records = reader.read(None).unwrap();
        assert_eq!(records[0].feature("mmse_score").unwrap().as_f64(), Some(24.0));
    }

    #[test]
    fn test_duplicate_within_batch_last_wins() {
        let dir = TempDir::new().unwrap();
        let report = writer(&dir)
            .write(
                vec![
                    record("P001", date!(2024 - 03 - 15), 27.0),
                    record("P001", date!(2024 - 03 - 15), 19.0),
                ],
                None,
            )
            .unwrap();
        assert_eq!(report.created + report.updated, 2);

        let id = PartitionId::for_visit("adni", date!(2024 - 03 - 15));
        let records = PartitionReader::open(dir.path(), &id)
            .unwrap()
            .read(None)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].feature("mmse_score").unwrap().as_f64(), Some(19.0));
    }

    #[test]
    fn test_batch_spans_months() {
        let dir = TempDir::new().unwrap();
        let report = writer(&dir)
            .write(
                vec![
                    record("P001", date!(2024 - 01 - 10), 27.0),
                    record("P001", date!(2024 - 02 - 10), 26.0),
                    record("P001", date!(2024 - 03 - 10), 25.0),
                ],
                None,
            )
            .unwrap();
        assert_eq!(report.created, 3);

        let partitions = crate::partition::discover_partitions(dir.path()).unwrap();
        assert_eq!(partitions.len(), 3);
    }

    #[test]
    fn test_malformed_record_rejected_batch_continues() {
        let dir = TempDir::new().unwrap();
        let report = writer(&dir)
            .write(
                vec![
                    FeatureRecord::new("", date!(2024 - 03 - 15), "adni"),
                    record("P002", date!(2024 - 03 - 15), 22.0),
                ],
                None,
            )
            .unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 0);
    }

    #[test]
    fn test_cohort_parameter_fills_blank() {
        let dir = TempDir::new().unwrap();
        let report = writer(&dir)
            .write(
                vec![FeatureRecord::new("P001", date!(2024 - 03 - 15), "")
                    .with_feature("mmse_score", 27.0)],
                Some("ukbb"),
            )
            .unwrap();
        assert_eq!(report.written, 1);

        let id = PartitionId::for_visit("ukbb", date!(2024 - 03 - 15));
        assert!(PartitionManifest::exists(&id.dir(dir.path())));
    }

    #[test]
    fn test_sequence_advances_and_old_file_removed() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer
            .write(vec![record("P001", date!(2024 - 03 - 15), 27.0)], None)
            .unwrap();
        writer
            .write(vec![record("P002", date!(2024 - 03 - 16), 23.0)], None)
            .unwrap();

        let id = PartitionId::for_visit("adni", date!(2024 - 03 - 15));
        let manifest = PartitionManifest::load(&id.dir(dir.path())).unwrap();
        assert_eq!(manifest.sequence, 1);
        assert_eq!(manifest.record_count, 2);
        assert!(!id.dir(dir.path()).join(data_file_name(0)).exists());
        assert!(id.dir(dir.path()).join(data_file_name(1)).exists());
    }

    #[test]
    fn test_rewrite_partition_changes_codec_only() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer
            .write(vec![record("P001", date!(2024 - 03 - 15), 27.0)], None)
            .unwrap();

        let id = PartitionId::for_visit("adni", date!(2024 - 03 - 15));
        let before = PartitionReader::open(dir.path(), &id)
            .unwrap()
            .read(None)
            .unwrap();

        writer.rewrite_partition(&id, Codec::Gzip, 6).unwrap();

        let manifest = PartitionManifest::load(&id.dir(dir.path())).unwrap();
        assert_eq!(manifest.codec, Codec::Gzip);
        assert_eq!(manifest.sequence, 1);
        let after = PartitionReader::open(dir.path(), &id)
            .unwrap()
            .read(None)
            .unwrap();
        assert_eq!(before, after);
    }
}

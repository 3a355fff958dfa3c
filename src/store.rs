//! The feature store facade.
//!
//! Composes the partition writer, index manager, query planner, cache, and
//! compression advisor behind one configuration object and one lifecycle:
//! open, serve reads and writes, flush. Writes to the same partition are
//! serialized on a per-partition lock; the index delta is applied and
//! persisted inside that lock, so a reader immediately after a write sees
//! the new data through the index.

use crate::advisor::{CompressionAdvisor, CompressionReport};
use crate::cache::{CachedReader, FeatureCache, GenerationMap, MemoryCache};
use crate::config::StoreConfig;
use crate::control::CancelToken;
use crate::error::Result;
use crate::index::{IndexManager, IndexStats, RebuildOutcome};
use crate::partition::{
    discover_partitions, Codec, PartitionManifest, PartitionWriter, WriteReport,
};
use crate::query::{QueryFilter, QueryPlanner};
use crate::record::{FeatureRecord, FeatureValue};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Partition-set totals, for observability.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageInfo {
    pub partitions: usize,
    pub records: u64,
    pub cohorts: usize,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

/// Outcome of `optimize_storage`.
#[derive(Debug, Clone)]
pub struct OptimizeStats {
    /// Partitions rewritten with the recommended codec.
    pub rewritten: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Codec applied, or `None` when the store already met its target.
    pub applied: Option<(Codec, i32)>,
}

/// Query results split into feature rows and their label column.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub features: Vec<FeatureRecord>,
    pub labels: Vec<FeatureValue>,
}

pub struct FeatureStore {
    config: StoreConfig,
    writer: PartitionWriter,
    index: Arc<IndexManager>,
    reader: CachedReader,
}

impl FeatureStore {
    /// Open a store with the default in-memory cache.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let cache = MemoryCache::new(config.cache_capacity, config.cache_ttl());
        Self::open_with_cache(config, Box::new(cache))
    }

    /// Open a store with an injected cache implementation.
    pub fn open_with_cache(config: StoreConfig, cache: Box<dyn FeatureCache>) -> Result<Self> {
        std::fs::create_dir_all(config.storage_root())?;
        let index = Arc::new(IndexManager::open(config.index_root())?);
        let writer = PartitionWriter::new(
            config.storage_root(),
            config.codec,
            config.compression_level,
        );
        let planner = QueryPlanner::new(config.storage_root(), index.clone(), config.scan_threads);
        let reader = CachedReader::new(planner, cache, Arc::new(GenerationMap::new()));
        Ok(Self {
            config,
            writer,
            index,
            reader,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Ingest a batch. Records are grouped by `(cohort, year, month)`; each
    /// partition commits atomically and its index delta is applied before
    /// the partition lock is released. Malformed records are reported in
    /// the result, never failing the batch.
    pub fn write(&self, records: Vec<FeatureRecord>, cohort: Option<&str>) -> Result<WriteReport> {
        let (groups, mut report) = self.writer.prepare_batch(records, cohort);
        for (id, incoming) in groups {
            let patients: BTreeSet<String> =
                incoming.iter().map(|r| r.patient_id.clone()).collect();

            let lock = self.writer.partition_lock(&id);
            let guard = lock.lock().expect("partition lock poisoned");
            let outcome = self.writer.write_partition(&id, incoming)?;
            self.index.apply_partition(&id, &outcome.records)?;
            drop(guard);

            for patient in patients {
                self.reader.note_write(&patient);
            }
            report.created += outcome.created;
            report.updated += outcome.updated;
            report.compressed_bytes += outcome.compressed_bytes;
        }
        report.written = report.created + report.updated;
        Ok(report)
    }

    /// General query per the planner's filter semantics.
    pub fn query(&self, filter: &QueryFilter) -> Result<Vec<FeatureRecord>> {
        self.reader.planner().query(filter, &CancelToken::new())
    }

    /// As `query`, with cooperative cancellation for long scans.
    pub fn query_with_cancel(
        &self,
        filter: &QueryFilter,
        cancel: &CancelToken,
    ) -> Result<Vec<FeatureRecord>> {
        self.reader.planner().query(filter, cancel)
    }

    /// All records for one patient, cache-accelerated.
    pub fn get_by_patient(
        &self,
        patient_id: &str,
        columns: Option<&[String]>,
    ) -> Result<Vec<FeatureRecord>> {
        self.reader.get_by_patient(patient_id, columns)
    }

    /// Most recent record for one patient, cache-accelerated.
    pub fn latest_for_patient(&self, patient_id: &str) -> Result<Option<FeatureRecord>> {
        self.reader.latest_for_patient(patient_id)
    }

    /// Query plus a per-record completeness filter against `label_column`.
    /// Records lacking the label are skipped; completeness is the fraction
    /// of the result set's feature columns present on the record.
    pub fn training_set(
        &self,
        cohorts: Option<&[String]>,
        label_column: &str,
        min_completeness: f64,
    ) -> Result<TrainingSet> {
        let mut filter = QueryFilter::new();
        if let Some(cohorts) = cohorts {
            filter = filter.cohorts(cohorts.iter().cloned());
        }
        let records = self.query(&filter)?;

        let feature_columns: Vec<String> = records
            .iter()
            .flat_map(|record| record.features.keys().cloned())
            .filter(|column| column != label_column)
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();

        let mut features = Vec::new();
        let mut labels = Vec::new();
        for mut record in records {
            let Some(label) = record.features.remove(label_column) else {
                continue;
            };
            if record.completeness(&feature_columns) < min_completeness {
                continue;
            }
            features.push(record);
            labels.push(label);
        }
        Ok(TrainingSet { features, labels })
    }

    /// Reconstruct all indexes from partition manifests. May run while
    /// reads and writes continue; a rebuild overtaken by incremental
    /// updates reports `Superseded` and changes nothing.
    pub fn rebuild_index(&self, cancel: &CancelToken) -> Result<RebuildOutcome> {
        self.index.rebuild(&self.config.storage_root(), cancel)
    }

    /// Cross-check indexes against the on-disk partition set.
    pub fn verify_index(&self) -> Result<()> {
        self.index.verify(&self.config.storage_root())
    }

    /// Apply the advisor's recommendation by rewriting partitions through
    /// the write path. Cancellation takes effect between partitions; every
    /// partition is always left in a fully-published state, and record
    /// content is never changed by a rewrite.
    pub fn optimize_storage(&self, cancel: &CancelToken) -> Result<OptimizeStats> {
        let report = self.advisor().analyze()?;
        let Some(recommendation) = report.recommendation else {
            return Ok(OptimizeStats {
                rewritten: 0,
                bytes_before: report.total_compressed_bytes,
                bytes_after: report.total_compressed_bytes,
                applied: None,
            });
        };

        let mut stats = OptimizeStats {
            rewritten: 0,
            bytes_before: 0,
            bytes_after: 0,
            applied: Some((recommendation.codec, recommendation.level)),
        };
        log::info!("optimizing storage: {}", recommendation.reason);
        for entry in &report.partitions {
            cancel.check()?;
            let lock = self.writer.partition_lock(&entry.partition);
            let _guard = lock.lock().expect("partition lock poisoned");
            let after = self.writer.rewrite_partition(
                &entry.partition,
                recommendation.codec,
                recommendation.level,
            )?;
            stats.rewritten += 1;
            stats.bytes_before += entry.compressed_bytes;
            stats.bytes_after += after;
        }
        Ok(stats)
    }

    /// Drop cache state for one patient, or everything.
    pub fn clear_cache(&self, patient_id: Option<&str>) {
        match patient_id {
            Some(patient_id) => self.reader.invalidate(patient_id),
            None => self.reader.clear(),
        }
    }

    pub fn storage_info(&self) -> Result<StorageInfo> {
        let storage_root = self.config.storage_root();
        let mut info = StorageInfo {
            partitions: 0,
            records: 0,
            cohorts: 0,
            uncompressed_bytes: 0,
            compressed_bytes: 0,
        };
        let mut cohorts = BTreeSet::new();
        for id in discover_partitions(&storage_root)? {
            let manifest = PartitionManifest::load(&id.dir(&storage_root))?;
            info.partitions += 1;
            info.records += manifest.record_count;
            info.uncompressed_bytes += manifest.uncompressed_bytes;
            info.compressed_bytes += manifest.compressed_bytes;
            cohorts.insert(id.cohort);
        }
        info.cohorts = cohorts.len();
        Ok(info)
    }

    pub fn compression_stats(&self) -> Result<CompressionReport> {
        self.advisor().analyze()
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    /// Persist index state. Deltas already persist as they apply; this is
    /// the explicit end-of-lifecycle flush.
    pub fn flush(&self) -> Result<()> {
        self.index.flush()
    }

    pub fn advisor(&self) -> CompressionAdvisor {
        CompressionAdvisor::new(self.config.storage_root(), self.config.target_ratio)
    }
}

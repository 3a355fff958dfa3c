//! Derived lookup indexes over partitions.
//!
//! Three independent indexes direct queries to candidate partitions:
//! patient, date, and cohort. They are a derived view of the partition set:
//! re-deriving them from the manifests must always produce the same content
//! the incremental write path maintained. Each index is persisted to its
//! own versioned JSON file with atomic replace, alongside a metadata file
//! carrying the index generation.

use crate::control::CancelToken;
use crate::error::{Error, Result};
use crate::partition::{discover_partitions, PartitionId, PartitionManifest, PartitionReader};
use crate::record::{now_ns, FeatureRecord};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use time::Date;

pub const INDEX_VERSION: u32 = 1;

const PATIENT_INDEX_FILENAME: &str = "patient.idx.json";
const DATE_INDEX_FILENAME: &str = "date.idx.json";
const COHORT_INDEX_FILENAME: &str = "cohort.idx.json";
const INDEX_META_FILENAME: &str = "index_meta.json";

/// Where a patient's records can be found.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct PatientLocation {
    pub partition: PartitionId,
    /// Row of the patient's first record within the partition block.
    pub row_hint: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct IndexMeta {
    version: u32,
    /// Bumped on every applied delta; rebuilds only replace the maintained
    /// index when their snapshot generation is still current.
    generation: u64,
    last_rebuild_ns: u64,
}

impl Default for IndexMeta {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            generation: 0,
            last_rebuild_ns: 0,
        }
    }
}

/// Serialized form of one index file.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct IndexFile<T> {
    version: u32,
    generation: u64,
    entries: T,
}

type PatientEntries = BTreeMap<String, BTreeSet<PatientLocation>>;
type DateEntries = BTreeMap<String, BTreeSet<PartitionId>>;
type CohortEntries = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Default, Clone, PartialEq)]
struct IndexState {
    patient: PatientEntries,
    date: DateEntries,
    cohort: CohortEntries,
}

impl IndexState {
    /// Drop every entry referencing `id`, then insert entries for the
    /// partition's new record set. Applying this for every write in any
    /// order converges on the same state a full rebuild produces.
    fn apply_partition(&mut self, id: &PartitionId, records: &[FeatureRecord]) {
        self.patient.retain(|_, locations| {
            locations.retain(|loc| loc.partition != *id);
            !locations.is_empty()
        });
        for partitions in self.date.values_mut() {
            partitions.remove(id);
        }
        self.date.retain(|_, partitions| !partitions.is_empty());

        for (row, record) in records.iter().enumerate() {
            let locations = self.patient.entry(record.patient_id.clone()).or_default();
            if !locations.iter().any(|loc| loc.partition == *id) {
                locations.insert(PatientLocation {
                    partition: id.clone(),
                    row_hint: row as u32,
                });
            }
            self.cohort
                .entry(record.cohort.clone())
                .or_default()
                .insert(record.patient_id.clone());
        }
        if !records.is_empty() {
            self.date
                .entry(id.month_key())
                .or_default()
                .insert(id.clone());
        }
    }
}

/// Outcome of a full rebuild.
#[derive(Debug, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The rebuilt index replaced the maintained one.
    Rebuilt { partitions: usize },
    /// Incremental deltas advanced the index while the rebuild scanned;
    /// the maintained (newer) index was kept.
    Superseded,
}

/// Entry counts and freshness, for observability.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub patients: usize,
    pub partitions: usize,
    pub cohorts: usize,
    pub generation: u64,
    pub last_rebuild_ns: u64,
}

pub struct IndexManager {
    root: PathBuf,
    inner: RwLock<(IndexState, IndexMeta)>,
}

impl IndexManager {
    /// Open the index root, loading persisted indexes when present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let meta = load_json::<IndexMeta>(&root.join(INDEX_META_FILENAME))?
            .map(|meta| {
                if meta.version != INDEX_VERSION {
                    Err(Error::UnsupportedVersion(meta.version))
                } else {
                    Ok(meta)
                }
            })
            .transpose()?
            .unwrap_or_default();

        let state = IndexState {
            patient: load_index_file(&root.join(PATIENT_INDEX_FILENAME))?,
            date: load_index_file(&root.join(DATE_INDEX_FILENAME))?,
            cohort: load_index_file(&root.join(COHORT_INDEX_FILENAME))?,
        };

        Ok(Self {
            root,
            inner: RwLock::new((state, meta)),
        })
    }

    /// Apply and durably persist the index delta for one rewritten
    /// partition. Runs synchronously in the write path: the caller's write
    /// is not complete until this returns.
    pub fn apply_partition(&self, id: &PartitionId, records: &[FeatureRecord]) -> Result<()> {
        let mut inner = self.inner.write().expect("index lock poisoned");
        inner.0.apply_partition(id, records);
        inner.1.generation += 1;
        persist(&self.root, &inner.0, &inner.1)
    }

    /// Reconstruct all three indexes from the partition manifests under
    /// `storage_root`. Safe to run while reads and incremental writes
    /// continue; the maintained index is only replaced if no delta advanced
    /// it past this rebuild's snapshot.
    pub fn rebuild(&self, storage_root: &Path, cancel: &CancelToken) -> Result<RebuildOutcome> {
        let snapshot_generation = {
            let inner = self.inner.read().expect("index lock poisoned");
            inner.1.generation
        };

        let partitions = discover_partitions(storage_root)?;
        let mut state = IndexState::default();
        for id in &partitions {
            cancel.check()?;
            let reader = PartitionReader::open(storage_root, id)?;
            let records = reader.read_keys()?;
            state.apply_partition(id, &records);
        }

        let mut inner = self.inner.write().expect("index lock poisoned");
        if inner.1.generation != snapshot_generation {
            log::info!(
                "index rebuild superseded by {} incremental updates",
                inner.1.generation - snapshot_generation
            );
            return Ok(RebuildOutcome::Superseded);
        }
        inner.0 = state;
        inner.1.generation += 1;
        inner.1.last_rebuild_ns = now_ns();
        persist(&self.root, &inner.0, &inner.1)?;
        Ok(RebuildOutcome::Rebuilt {
            partitions: partitions.len(),
        })
    }

    /// Check that the index and the on-disk partition set agree: every
    /// indexed partition must have a manifest, and every manifest must be
    /// indexed. Failure means the index must be rebuilt, never served.
    pub fn verify(&self, storage_root: &Path) -> Result<()> {
        let on_disk: BTreeSet<PartitionId> =
            discover_partitions(storage_root)?.into_iter().collect();
        let indexed = self.all_partitions();

        if let Some(missing) = indexed.difference(&on_disk).next() {
            return Err(Error::IndexInconsistency(format!(
                "index references partition {} with no manifest on disk",
                missing
            )));
        }
        if let Some(unindexed) = on_disk.difference(&indexed).next() {
            let manifest = PartitionManifest::load(&unindexed.dir(storage_root))?;
            if manifest.record_count > 0 {
                return Err(Error::IndexInconsistency(format!(
                    "partition {} is not covered by the date index",
                    unindexed
                )));
            }
        }
        Ok(())
    }

    pub fn locations_for_patient(&self, patient_id: &str) -> Vec<PatientLocation> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .0
            .patient
            .get(patient_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Partitions whose month overlaps `[start, end]` (inclusive).
    pub fn partitions_for_date_range(&self, start: Date, end: Date) -> BTreeSet<PartitionId> {
        let start_key = format!("{:04}-{:02}", start.year(), u8::from(start.month()));
        let end_key = format!("{:04}-{:02}", end.year(), u8::from(end.month()));
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .0
            .date
            .range(start_key..=end_key)
            .flat_map(|(_, partitions)| partitions.iter().cloned())
            .collect()
    }

    pub fn patients_for_cohort(&self, cohort: &str) -> BTreeSet<String> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner.0.cohort.get(cohort).cloned().unwrap_or_default()
    }

    pub fn partitions_for_cohort(&self, cohort: &str) -> BTreeSet<PartitionId> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .0
            .date
            .values()
            .flat_map(|partitions| partitions.iter())
            .filter(|id| id.cohort == cohort)
            .cloned()
            .collect()
    }

    pub fn all_partitions(&self) -> BTreeSet<PartitionId> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .0
            .date
            .values()
            .flat_map(|partitions| partitions.iter().cloned())
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read().expect("index lock poisoned");
        IndexStats {
            patients: inner.0.patient.len(),
            partitions: inner
                .0
                .date
                .values()
                .map(|partitions| partitions.len())
                .sum(),
            cohorts: inner.0.cohort.len(),
            generation: inner.1.generation,
            last_rebuild_ns: inner.1.last_rebuild_ns,
        }
    }

    /// Persist the current in-memory state. Deltas already persist as they
    /// are applied; this exists for explicit flushes.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.read().expect("index lock poisoned");
        persist(&self.root, &inner.0, &inner.1)
    }
}

fn persist(root: &Path, state: &IndexState, meta: &IndexMeta) -> Result<()> {
    save_json(
        &root.join(PATIENT_INDEX_FILENAME),
        &IndexFile {
            version: INDEX_VERSION,
            generation: meta.generation,
            entries: &state.patient,
        },
    )?;
    save_json(
        &root.join(DATE_INDEX_FILENAME),
        &IndexFile {
            version: INDEX_VERSION,
            generation: meta.generation,
            entries: &state.date,
        },
    )?;
    save_json(
        &root.join(COHORT_INDEX_FILENAME),
        &IndexFile {
            version: INDEX_VERSION,
            generation: meta.generation,
            entries: &state.cohort,
        },
    )?;
    save_json(&root.join(INDEX_META_FILENAME), meta)
}

fn save_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| Error::CorruptManifest(format!("{}: {}", path.display(), e)))
}

fn load_index_file<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match load_json::<IndexFile<T>>(path)? {
        None => Ok(T::default()),
        Some(file) if file.version != INDEX_VERSION => Err(Error::UnsupportedVersion(file.version)),
        Some(file) => Ok(file.entries),
    }
}

//! Query planning and execution.
//!
//! A query resolves to a candidate partition set through the narrowest
//! applicable index; filters combine by intersecting candidate sets before
//! any data file is opened. Row-level predicates apply after pruning, and
//! only the requested feature columns are decoded.

use crate::control::CancelToken;
use crate::error::{Error, Result};
use crate::index::IndexManager;
use crate::partition::{PartitionId, PartitionManifest, PartitionReader};
use crate::record::FeatureRecord;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use time::Date;

/// Ordering of a merged result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultOrder {
    /// `(patient_id, visit_date)` ascending.
    #[default]
    PatientThenDate,
    /// `(visit_date, patient_id)` ascending.
    DateThenPatient,
}

/// Declarative query filter. An empty filter is a full scan.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub patient_ids: Option<Vec<String>>,
    pub cohorts: Option<Vec<String>>,
    /// Inclusive visit-date bounds.
    pub date_range: Option<(Date, Date)>,
    /// Feature columns to decode; `None` decodes everything.
    pub columns: Option<Vec<String>>,
    pub order: ResultOrder,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patients<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patient_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn cohorts<I, S>(mut self, cohorts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cohorts = Some(cohorts.into_iter().map(Into::into).collect());
        self
    }

    pub fn date_range(mut self, start: Date, end: Date) -> Self {
        self.date_range = Some((start, end));
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn order(mut self, order: ResultOrder) -> Self {
        self.order = order;
        self
    }

    pub fn is_unfiltered(&self) -> bool {
        self.patient_ids.is_none() && self.cohorts.is_none() && self.date_range.is_none()
    }
}

pub struct QueryPlanner {
    storage_root: PathBuf,
    index: Arc<IndexManager>,
    /// Worker threads for multi-partition scans.
    scan_threads: usize,
}

impl QueryPlanner {
    pub fn new(storage_root: impl Into<PathBuf>, index: Arc<IndexManager>, scan_threads: usize) -> Self {
        Self {
            storage_root: storage_root.into(),
            index,
            scan_threads: scan_threads.max(1),
        }
    }

    /// Execute a query. Empty results are empty vectors, never errors.
    pub fn query(&self, filter: &QueryFilter, cancel: &CancelToken) -> Result<Vec<FeatureRecord>> {
        if let Some((start, end)) = filter.date_range {
            if start > end {
                return Ok(Vec::new());
            }
        }

        let candidates = self.candidate_partitions(filter);
        let candidates: Vec<PartitionId> = candidates.into_iter().collect();
        let mut records = self.read_partitions(&candidates, filter, cancel)?;

        match filter.order {
            ResultOrder::PatientThenDate => records.sort_by(|a, b| a.key_cmp(b)),
            ResultOrder::DateThenPatient => records.sort_by(|a, b| {
                a.visit_date
                    .cmp(&b.visit_date)
                    .then_with(|| a.patient_id.cmp(&b.patient_id))
            }),
        }
        Ok(records)
    }

    /// Intersect the candidate sets of every applicable index.
    fn candidate_partitions(&self, filter: &QueryFilter) -> BTreeSet<PartitionId> {
        let mut candidates: Option<BTreeSet<PartitionId>> = None;
        let mut intersect = |set: BTreeSet<PartitionId>| {
            candidates = Some(match candidates.take() {
                None => set,
                Some(current) => current.intersection(&set).cloned().collect(),
            });
        };

        if let Some(patients) = &filter.patient_ids {
            intersect(
                patients
                    .iter()
                    .flat_map(|id| self.index.locations_for_patient(id))
                    .map(|loc| loc.partition)
                    .collect(),
            );
        }
        if let Some(cohorts) = &filter.cohorts {
            intersect(
                cohorts
                    .iter()
                    .flat_map(|cohort| self.index.partitions_for_cohort(cohort))
                    .collect(),
            );
        }
        if let Some((start, end)) = filter.date_range {
            intersect(self.index.partitions_for_date_range(start, end));
        }

        match candidates {
            Some(set) => set,
            None => {
                let all = self.index.all_partitions();
                log::debug!("unfiltered query: full scan across {} partitions", all.len());
                all
            }
        }
    }

    fn read_partitions(
        &self,
        ids: &[PartitionId],
        filter: &QueryFilter,
        cancel: &CancelToken,
    ) -> Result<Vec<FeatureRecord>> {
        let workers = self.scan_threads.min(ids.len());
        if workers <= 1 {
            let mut out = Vec::new();
            for id in ids {
                cancel.check()?;
                out.extend(self.read_one(id, filter)?);
            }
            return Ok(out);
        }

        let results: Vec<Result<Vec<FeatureRecord>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    scope.spawn(move || {
                        let mut out = Vec::new();
                        for id in ids.iter().skip(worker).step_by(workers) {
                            cancel.check()?;
                            out.extend(self.read_one(id, filter)?);
                        }
                        Ok(out)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Corrupt("scan worker panicked")))
                })
                .collect()
        });

        let mut out = Vec::new();
        for result in results {
            out.extend(result?);
        }
        Ok(out)
    }

    /// Read one candidate partition and apply row-level predicates.
    fn read_one(&self, id: &PartitionId, filter: &QueryFilter) -> Result<Vec<FeatureRecord>> {
        let dir = id.dir(&self.storage_root);
        if !PartitionManifest::exists(&dir) {
            // The index pointed at a partition that no longer exists; the
            // caller should rebuild rather than serve a partial answer.
            return Err(Error::IndexInconsistency(format!(
                "partition {} referenced by index has no manifest",
                id
            )));
        }

        let reader = PartitionReader::open(&self.storage_root, id)?;
        let mut records = reader.read(filter.columns.as_deref())?;

        let patients: Option<HashSet<&str>> = filter
            .patient_ids
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect());
        records.retain(|record| {
            if let Some(patients) = &patients {
                if !patients.contains(record.patient_id.as_str()) {
                    return false;
                }
            }
            if let Some((start, end)) = filter.date_range {
                if record.visit_date < start || record.visit_date > end {
                    return false;
                }
            }
            true
        });
        Ok(records)
    }
}

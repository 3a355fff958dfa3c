//! Generation-aware read cache for hot single-patient lookups.
//!
//! The cache itself is an injected dependency behind the `FeatureCache`
//! trait; the store never owns process-wide cache state. Staleness is
//! detected two ways: entries expire by TTL, and every entry carries the
//! per-patient generation it was filled at. A write bumps the patient's
//! generation, so a later read treats the entry as a miss without any
//! eager eviction scan.

use crate::control::CancelToken;
use crate::error::Result;
use crate::query::{QueryFilter, QueryPlanner};
use crate::record::FeatureRecord;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// A cached result with the generation it was computed at.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub records: Vec<FeatureRecord>,
    pub generation: u64,
}

/// Injected cache interface. Implementations own expiry; callers own
/// generation verification.
pub trait FeatureCache: Send + Sync {
    /// Look up a signature. Expired entries are dropped, not returned.
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn set(&self, key: &str, entry: CacheEntry);
    /// Drop every entry belonging to one patient.
    fn invalidate(&self, patient_id: &str);
    fn clear(&self);
    fn ttl(&self) -> Duration;
}

/// In-memory LRU cache with TTL expiry.
pub struct MemoryCache {
    inner: Mutex<LruCache<String, (CacheEntry, Instant)>>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }
}

impl FeatureCache for MemoryCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let (entry, expires_at) = inner
            .get(key)
            .map(|(entry, expires_at)| (entry.clone(), *expires_at))?;
        if expires_at < Instant::now() {
            inner.pop(key);
            return None;
        }
        Some(entry)
    }

    fn set(&self, key: &str, entry: CacheEntry) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.put(key.to_string(), (entry, Instant::now() + self.ttl));
    }

    fn invalidate(&self, patient_id: &str) {
        let prefix = signature_prefix(patient_id);
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let stale: Vec<String> = inner
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            inner.pop(&key);
        }
    }

    fn clear(&self) {
        self.inner.lock().expect("cache lock poisoned").clear();
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Per-patient monotonic generation counters. Increment-and-fetch is
/// atomic, so concurrent writers never lose an invalidation.
#[derive(Default)]
pub struct GenerationMap {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl GenerationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, patient_id: &str) -> u64 {
        let counters = self.counters.read().expect("generation lock poisoned");
        counters
            .get(patient_id)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Bump and return the new generation for a patient.
    pub fn bump(&self, patient_id: &str) -> u64 {
        let counter = {
            let counters = self.counters.read().expect("generation lock poisoned");
            counters.get(patient_id).cloned()
        };
        let counter = match counter {
            Some(counter) => counter,
            None => {
                let mut counters = self.counters.write().expect("generation lock poisoned");
                counters
                    .entry(patient_id.to_string())
                    .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                    .clone()
            }
        };
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn signature_prefix(patient_id: &str) -> String {
    format!("patient={}:", patient_id)
}

/// Cache signature for a single-patient lookup.
fn signature(patient_id: &str, columns: Option<&[String]>, latest: bool) -> String {
    let mut key = signature_prefix(patient_id);
    if latest {
        key.push_str("latest");
    } else {
        match columns {
            None => key.push_str("cols=*"),
            Some(columns) => {
                key.push_str("cols=");
                key.push_str(&columns.join(","));
            }
        }
    }
    key
}

/// Planner wrapper serving hot single-patient lookups through the cache.
pub struct CachedReader {
    planner: QueryPlanner,
    cache: Box<dyn FeatureCache>,
    generations: Arc<GenerationMap>,
}

impl CachedReader {
    pub fn new(
        planner: QueryPlanner,
        cache: Box<dyn FeatureCache>,
        generations: Arc<GenerationMap>,
    ) -> Self {
        Self {
            planner,
            cache,
            generations,
        }
    }

    /// All records for a patient, ordered by visit date.
    pub fn get_by_patient(
        &self,
        patient_id: &str,
        columns: Option<&[String]>,
    ) -> Result<Vec<FeatureRecord>> {
        let key = signature(patient_id, columns, false);
        if let Some(records) = self.lookup(&key, patient_id) {
            return Ok(records);
        }

        let mut filter = QueryFilter::new().patients([patient_id]);
        filter.columns = columns.map(|cols| cols.to_vec());
        let records = self.planner.query(&filter, &CancelToken::new())?;
        self.fill(&key, patient_id, records.clone());
        Ok(records)
    }

    /// The most recent record for a patient, by visit date then ingestion
    /// order.
    pub fn latest_for_patient(&self, patient_id: &str) -> Result<Option<FeatureRecord>> {
        let key = signature(patient_id, None, true);
        if let Some(records) = self.lookup(&key, patient_id) {
            return Ok(records.into_iter().next());
        }

        let filter = QueryFilter::new().patients([patient_id]);
        let records = self.planner.query(&filter, &CancelToken::new())?;
        let latest = records.into_iter().max_by(|a, b| {
            a.visit_date
                .cmp(&b.visit_date)
                .then(a.ingestion_timestamp.cmp(&b.ingestion_timestamp))
        });
        self.fill(&key, patient_id, latest.clone().into_iter().collect());
        Ok(latest)
    }

    /// Signal that a write touched `patient_id`.
    pub fn note_write(&self, patient_id: &str) {
        self.generations.bump(patient_id);
    }

    pub fn invalidate(&self, patient_id: &str) {
        self.generations.bump(patient_id);
        self.cache.invalidate(patient_id);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    fn lookup(&self, key: &str, patient_id: &str) -> Option<Vec<FeatureRecord>> {
        let entry = self.cache.get(key)?;
        if entry.generation != self.generations.current(patient_id) {
            // Stale: a write bumped the generation after this entry was
            // filled. Detected lazily, no eviction scan on the write path.
            return None;
        }
        Some(entry.records)
    }

    fn fill(&self, key: &str, patient_id: &str, records: Vec<FeatureRecord>) {
        let entry = CacheEntry {
            records,
            generation: self.generations.current(patient_id),
        };
        self.cache.set(key, entry);
    }
}

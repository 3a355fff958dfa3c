//! Feature record data model.
//!
//! A `FeatureRecord` is one patient visit's feature vector. The feature
//! columns are an open schema: producers emit whatever columns they have,
//! and the store only validates structural completeness.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use time::Date;

/// A single feature cell value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Numeric(f64),
    Categorical(String),
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Numeric(v) => write!(f, "{}", v),
            FeatureValue::Categorical(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Numeric(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(s: &str) -> Self {
        FeatureValue::Categorical(s.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(s: String) -> Self {
        FeatureValue::Categorical(s)
    }
}

impl FeatureValue {
    /// Numeric payload, if this is a numeric cell.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Numeric(v) => Some(*v),
            FeatureValue::Categorical(_) => None,
        }
    }
}

/// One patient visit's feature vector.
///
/// Natural key: `(patient_id, visit_date, cohort)`. A second write with the
/// same key replaces the stored record, it never duplicates it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FeatureRecord {
    pub patient_id: String,
    pub visit_date: Date,
    pub cohort: String,
    /// Open feature-column schema. `BTreeMap` keeps column order stable so
    /// encoded blocks are deterministic.
    pub features: BTreeMap<String, FeatureValue>,
    /// Nanoseconds since the Unix epoch, stamped by the store on write.
    /// Zero until the record has been accepted.
    #[serde(default)]
    pub ingestion_timestamp: u64,
}

impl FeatureRecord {
    pub fn new(
        patient_id: impl Into<String>,
        visit_date: Date,
        cohort: impl Into<String>,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            visit_date,
            cohort: cohort.into(),
            features: BTreeMap::new(),
            ingestion_timestamp: 0,
        }
    }

    /// Builder-style feature insertion.
    pub fn with_feature(mut self, name: &str, value: impl Into<FeatureValue>) -> Self {
        self.features.insert(name.to_string(), value.into());
        self
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureValue> {
        self.features.get(name)
    }

    /// Structural validation applied at ingestion. Feature semantics are
    /// deliberately not checked here.
    pub fn validate(&self) -> Result<()> {
        if self.patient_id.is_empty() {
            return Err(Error::InvalidRecord("missing patient_id".to_string()));
        }
        if self.cohort.is_empty() {
            return Err(Error::InvalidRecord(format!(
                "missing cohort for patient '{}'",
                self.patient_id
            )));
        }
        if self.cohort.contains(['/', '\\', '=']) {
            return Err(Error::InvalidRecord(format!(
                "cohort '{}' contains path separator characters",
                self.cohort
            )));
        }
        Ok(())
    }

    /// Natural-key ordering: `(patient_id, visit_date)`. Records compared
    /// this way always belong to the same cohort (one partition holds one
    /// cohort), so the cohort component is not consulted.
    pub fn key_cmp(&self, other: &FeatureRecord) -> Ordering {
        self.patient_id
            .cmp(&other.patient_id)
            .then(self.visit_date.cmp(&other.visit_date))
    }

    /// Fraction of `columns` present on this record. Used by the
    /// training-set completeness filter.
    pub fn completeness(&self, columns: &[String]) -> f64 {
        if columns.is_empty() {
            return 1.0;
        }
        let present = columns
            .iter()
            .filter(|c| self.features.contains_key(*c))
            .count();
        present as f64 / columns.len() as f64
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub(crate) fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

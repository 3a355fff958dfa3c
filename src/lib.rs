//! Partitioned columnar feature store for longitudinal clinical data.
//!
//! The store sits between feature-engineering output and model training:
//! producers write batches of [`FeatureRecord`]s, which land in immutable,
//! compressed partitions keyed by `(cohort, year, month)`; three derived
//! indexes direct queries to the minimal partition set; hot single-patient
//! lookups go through a generation-aware cache.
//!
//! # Example
//!
//! ```no_run
//! use cohortstore::{FeatureRecord, FeatureStore, QueryFilter, StoreConfig};
//! use time::macros::date;
//!
//! let store = FeatureStore::open(StoreConfig::new("./feature_store"))?;
//!
//! let record = FeatureRecord::new("P001", date!(2024 - 03 - 15), "adni")
//!     .with_feature("mmse_score", 27.0)
//!     .with_feature("apoe4", "carrier");
//! store.write(vec![record], None)?;
//!
//! let visits = store.get_by_patient("P001", None)?;
//! let cohort = store.query(&QueryFilter::new().cohorts(["adni"]))?;
//! # Ok::<(), cohortstore::Error>(())
//! ```

pub mod advisor;
pub mod cache;
pub mod config;
pub mod control;
pub mod error;
pub mod index;
pub mod partition;
pub mod query;
pub mod record;
pub mod store;

pub use advisor::{CompressionAdvisor, CompressionReport};
pub use cache::{CacheEntry, FeatureCache, MemoryCache};
pub use config::StoreConfig;
pub use control::CancelToken;
pub use error::{Error, Result};
pub use index::{IndexManager, IndexStats, RebuildOutcome};
pub use partition::{Codec, PartitionId, PartitionWriter, WriteReport};
pub use query::{QueryFilter, QueryPlanner, ResultOrder};
pub use record::{FeatureRecord, FeatureValue};
pub use store::{FeatureStore, StorageInfo, TrainingSet};

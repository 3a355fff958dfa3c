//! Offline compression analysis.
//!
//! The advisor only reads: `analyze` works from manifests alone, and
//! `compare` recompresses payloads in memory. Applying a recommendation is
//! the facade's `optimize_storage`, which rewrites partitions through the
//! normal write path.

use crate::control::CancelToken;
use crate::error::Result;
use crate::partition::{discover_partitions, Codec, PartitionId, PartitionManifest, PartitionReader};
use std::path::PathBuf;

/// Compression state of one partition.
#[derive(Debug, Clone)]
pub struct PartitionCompression {
    pub partition: PartitionId,
    pub codec: Codec,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    pub ratio: f64,
}

/// Suggested codec change when the aggregate ratio misses the target.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub codec: Codec,
    pub level: i32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CompressionReport {
    pub partitions: Vec<PartitionCompression>,
    pub total_uncompressed_bytes: u64,
    pub total_compressed_bytes: u64,
    /// Aggregate compressed/uncompressed ratio; lower is better.
    pub aggregate_ratio: f64,
    pub target_ratio: f64,
    /// Partitions individually missing the target.
    pub flagged: Vec<PartitionId>,
    pub recommendation: Option<Recommendation>,
}

impl CompressionReport {
    pub fn meets_target(&self) -> bool {
        self.aggregate_ratio <= self.target_ratio
    }
}

/// One candidate codec's result over the whole partition set.
#[derive(Debug, Clone)]
pub struct CodecTrial {
    pub codec: Codec,
    pub level: i32,
    pub total_uncompressed_bytes: u64,
    pub total_compressed_bytes: u64,
    pub ratio: f64,
}

pub struct CompressionAdvisor {
    storage_root: PathBuf,
    target_ratio: f64,
}

impl CompressionAdvisor {
    pub fn new(storage_root: impl Into<PathBuf>, target_ratio: f64) -> Self {
        Self {
            storage_root: storage_root.into(),
            target_ratio,
        }
    }

    /// Ratio report over the current partition set, from manifests only.
    pub fn analyze(&self) -> Result<CompressionReport> {
        let mut partitions = Vec::new();
        let mut flagged = Vec::new();
        let mut total_uncompressed = 0u64;
        let mut total_compressed = 0u64;
        let mut worst_codec: Option<Codec> = None;

        for id in discover_partitions(&self.storage_root)? {
            let manifest = PartitionManifest::load(&id.dir(&self.storage_root))?;
            let ratio = manifest.ratio();
            total_uncompressed += manifest.uncompressed_bytes;
            total_compressed += manifest.compressed_bytes;
            if ratio > self.target_ratio {
                flagged.push(id.clone());
            }
            worst_codec = Some(match worst_codec {
                None => manifest.codec,
                Some(codec) => codec.min(manifest.codec),
            });
            partitions.push(PartitionCompression {
                partition: id,
                codec: manifest.codec,
                uncompressed_bytes: manifest.uncompressed_bytes,
                compressed_bytes: manifest.compressed_bytes,
                ratio,
            });
        }

        let aggregate_ratio = if total_uncompressed == 0 {
            0.0
        } else {
            total_compressed as f64 / total_uncompressed as f64
        };

        let recommendation = if aggregate_ratio > self.target_ratio {
            Some(recommend(worst_codec, aggregate_ratio, self.target_ratio))
        } else {
            None
        };

        Ok(CompressionReport {
            partitions,
            total_uncompressed_bytes: total_uncompressed,
            total_compressed_bytes: total_compressed,
            aggregate_ratio,
            target_ratio: self.target_ratio,
            flagged,
            recommendation,
        })
    }

    /// Trial-compress every partition's payload with each candidate,
    /// ranked best ratio first. Partitions on disk are never touched.
    pub fn compare(
        &self,
        candidates: &[(Codec, i32)],
        cancel: &CancelToken,
    ) -> Result<Vec<CodecTrial>> {
        let ids = discover_partitions(&self.storage_root)?;
        let mut trials: Vec<CodecTrial> = candidates
            .iter()
            .map(|(codec, level)| CodecTrial {
                codec: *codec,
                level: *level,
                total_uncompressed_bytes: 0,
                total_compressed_bytes: 0,
                ratio: 0.0,
            })
            .collect();

        for id in &ids {
            cancel.check()?;
            let payload = PartitionReader::open(&self.storage_root, id)?.read_payload()?;
            for trial in trials.iter_mut() {
                let compressed = trial.codec.compress(&payload, trial.level)?;
                trial.total_uncompressed_bytes += payload.len() as u64;
                trial.total_compressed_bytes += compressed.len() as u64;
            }
        }

        for trial in trials.iter_mut() {
            trial.ratio = if trial.total_uncompressed_bytes == 0 {
                0.0
            } else {
                trial.total_compressed_bytes as f64 / trial.total_uncompressed_bytes as f64
            };
        }
        trials.sort_by(|a, b| {
            a.total_compressed_bytes
                .cmp(&b.total_compressed_bytes)
                .then_with(|| a.codec.cmp(&b.codec))
        });
        Ok(trials)
    }
}

fn recommend(current: Option<Codec>, aggregate: f64, target: f64) -> Recommendation {
    match current {
        Some(Codec::Zstd) => Recommendation {
            codec: Codec::Zstd,
            level: 19,
            reason: format!(
                "aggregate ratio {:.2} misses target {:.2}; raise zstd level",
                aggregate, target
            ),
        },
        _ => Recommendation {
            codec: Codec::Zstd,
            level: 19,
            reason: format!(
                "aggregate ratio {:.2} misses target {:.2}; switch to zstd",
                aggregate, target
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionWriter;
    use crate::record::FeatureRecord;
    use tempfile::TempDir;
    use time::macros::date;

    /// Numeric-heavy records with repetitive structure, the representative
    /// shape for a clinical feature table.
    fn write_table(root: &std::path::Path, codec: Codec) {
        let writer = PartitionWriter::new(root, codec, 3);
        let mut records = Vec::new();
        for patient in 0..200 {
            let mut record = FeatureRecord::new(
                format!("P{:04}", patient),
                date!(2024 - 03 - 01),
                "adni",
            );
            for column in 0..20 {
                record = record.with_feature(
                    &format!("feature_{:02}", column),
                    (patient % 7) as f64 * 0.5,
                );
            }
            records.push(record);
        }
        writer.write(records, None).unwrap();
    }

    #[test]
    fn test_analyze_meets_target_with_zstd() {
        let dir = TempDir::new().unwrap();
        write_table(dir.path(), Codec::Zstd);

        let advisor = CompressionAdvisor::new(dir.path(), 0.5);
        let report = advisor.analyze().unwrap();
        assert_eq!(report.partitions.len(), 1);
        assert!(report.meets_target(), "ratio {}", report.aggregate_ratio);
        assert!(report.flagged.is_empty());
        assert!(report.recommendation.is_none());
    }

    #[test]
    fn test_analyze_flags_uncompressed_partitions() {
        let dir = TempDir::new().unwrap();
        write_table(dir.path(), Codec::None);

        let advisor = CompressionAdvisor::new(dir.path(), 0.5);
        let report = advisor.analyze().unwrap();
        assert!(!report.meets_target());
        assert_eq!(report.flagged.len(), 1);
        let recommendation = report.recommendation.unwrap();
        assert_eq!(recommendation.codec, Codec::Zstd);
    }

    #[test]
    fn test_analyze_empty_store() {
        let dir = TempDir::new().unwrap();
        let advisor = CompressionAdvisor::new(dir.path(), 0.5);
        let report = advisor.analyze().unwrap();
        assert!(report.partitions.is_empty());
        assert_eq!(report.aggregate_ratio, 0.0);
        assert!(report.recommendation.is_none());
    }

    #[test]
    fn test_compare_ranks_codecs() {
        let dir = TempDir::new().unwrap();
        write_table(dir.path(), Codec::Zstd);

        let advisor = CompressionAdvisor::new(dir.path(), 0.5);
        let trials = advisor
            .compare(
                &[(Codec::None, 0), (Codec::Zstd, 3), (Codec::Gzip, 6)],
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(trials.len(), 3);
        // Ranked ascending by compressed size; identity never wins.
        assert!(trials[0].total_compressed_bytes <= trials[1].total_compressed_bytes);
        assert_eq!(trials[2].codec, Codec::None);
        // Comparing never rewrites the partition.
        let report = advisor.analyze().unwrap();
        assert_eq!(report.partitions[0].codec, Codec::Zstd);
    }

    #[test]
    fn test_compare_cancellable() {
        let dir = TempDir::new().unwrap();
        write_table(dir.path(), Codec::Zstd);
        let advisor = CompressionAdvisor::new(dir.path(), 0.5);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(advisor.compare(&[(Codec::Zstd, 3)], &cancel).is_err());
    }
}

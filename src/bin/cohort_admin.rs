use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cohortstore::{CancelToken, FeatureStore, StoreConfig};

#[derive(Parser)]
#[command(name = "cohort-admin")]
#[command(about = "Maintenance and observability for a cohortstore feature store")]
struct Cli {
    /// Store root directory
    #[arg(long)]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print partition counts and byte totals
    Info,
    /// Print per-partition and aggregate compression ratios
    Compression,
    /// Print index entry counts and freshness
    IndexStats,
    /// Reconstruct all indexes from partition manifests
    RebuildIndex,
    /// Cross-check indexes against the on-disk partition set
    Verify,
    /// Rewrite partitions with the advisor's recommended codec
    Optimize,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let store = FeatureStore::open(StoreConfig::new(cli.root))?;

    match cli.command {
        Command::Info => {
            let info = store.storage_info()?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Compression => {
            let report = store.compression_stats()?;
            for entry in &report.partitions {
                println!(
                    "{:<40} {:>12} -> {:>12} bytes  ratio {:.3}  [{}]",
                    entry.partition.to_string(),
                    entry.uncompressed_bytes,
                    entry.compressed_bytes,
                    entry.ratio,
                    entry.codec.name(),
                );
            }
            println!(
                "aggregate ratio {:.3} (target {:.3}), {} partition(s) flagged",
                report.aggregate_ratio,
                report.target_ratio,
                report.flagged.len(),
            );
            if let Some(recommendation) = &report.recommendation {
                println!(
                    "recommendation: {} level {} ({})",
                    recommendation.codec.name(),
                    recommendation.level,
                    recommendation.reason,
                );
            }
        }
        Command::IndexStats => {
            let stats = store.index_stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::RebuildIndex => {
            let outcome = store.rebuild_index(&CancelToken::new())?;
            println!("{:?}", outcome);
        }
        Command::Verify => {
            store.verify_index()?;
            println!("index consistent with partition set");
        }
        Command::Optimize => {
            let stats = store.optimize_storage(&CancelToken::new())?;
            match stats.applied {
                Some((codec, level)) => println!(
                    "rewrote {} partition(s) with {} level {}: {} -> {} bytes",
                    stats.rewritten,
                    codec.name(),
                    level,
                    stats.bytes_before,
                    stats.bytes_after,
                ),
                None => println!("compression target already met; nothing to do"),
            }
        }
    }

    Ok(())
}

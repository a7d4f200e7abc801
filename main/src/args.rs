use std::{collections::BTreeSet, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use common::utils::config::AppConfig;
use ingestion_pipeline::{IngestionConfig, IngestionTuning};

#[derive(Debug, Parser)]
#[command(name = "warehouse-loader", about = "Moves raw warehouse uploads into the training/validation lake")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one ingestion pass over the latest inventory report
    Ingest(IngestArgs),
    /// List the submitting sites named by raw clinical records
    Sites(PrefixArgs),
    /// Summarize stored bytes and object counts per prefix
    Storage(StorageArgs),
}

#[derive(Debug, Clone, Args)]
pub struct PrefixArgs {
    /// Only look at this raw prefix (repeatable); defaults to every configured one
    #[arg(long = "raw-prefix")]
    pub raw_prefixes: Vec<String>,
}

impl PrefixArgs {
    pub fn selection(&self) -> Option<BTreeSet<String>> {
        if self.raw_prefixes.is_empty() {
            None
        } else {
            Some(self.raw_prefixes.iter().cloned().collect())
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct IngestArgs {
    /// Log the copies and uploads a run would make without making them
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub prefixes: PrefixArgs,

    /// Keys processed concurrently
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Directory receiving ingestion.csv
    #[arg(long)]
    pub export_dir: Option<PathBuf>,
}

impl IngestArgs {
    /// Pipeline settings from the process configuration, with flags on top.
    pub fn pipeline_config(&self, cfg: &AppConfig) -> IngestionConfig {
        let mut pipeline_config = IngestionConfig::from_app_config(cfg);
        pipeline_config.dry_run = pipeline_config.dry_run || self.dry_run;
        if let Some(concurrency) = self.concurrency {
            pipeline_config.tuning = IngestionTuning {
                concurrency,
                ..pipeline_config.tuning
            };
        }
        pipeline_config.prefix_filter = self.prefixes.selection();
        pipeline_config
    }
}

#[derive(Debug, Clone, Args)]
pub struct StorageArgs {
    /// Prefix to summarize (repeatable); defaults to the lake partitions
    #[arg(long = "prefix")]
    pub prefixes: Vec<String>,

    /// Directory receiving storage.csv
    #[arg(long)]
    pub export_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_flags_override_process_configuration() {
        let cli = Cli::parse_from([
            "warehouse-loader",
            "ingest",
            "--dry-run",
            "--raw-prefix",
            "raw-a",
            "--raw-prefix",
            "raw-b",
            "--concurrency",
            "3",
        ]);
        let Command::Ingest(args) = cli.command else {
            panic!("expected ingest");
        };
        let pipeline_config = args.pipeline_config(&AppConfig::default());

        assert!(pipeline_config.dry_run);
        assert_eq!(pipeline_config.tuning.concurrency, 3);
        assert_eq!(pipeline_config.tuning.initial_range_kb, 20);
        assert_eq!(
            pipeline_config.prefix_filter,
            Some(BTreeSet::from(["raw-a".to_string(), "raw-b".to_string()]))
        );
    }

    #[test]
    fn defaults_come_from_process_configuration() {
        let cli = Cli::parse_from(["warehouse-loader", "ingest"]);
        let Command::Ingest(args) = cli.command else {
            panic!("expected ingest");
        };
        let cfg = AppConfig {
            dry_run: true,
            ingest_concurrency: 16,
            ..AppConfig::default()
        };
        let pipeline_config = args.pipeline_config(&cfg);

        assert!(pipeline_config.dry_run);
        assert_eq!(pipeline_config.tuning.concurrency, 16);
        assert!(pipeline_config.prefix_filter.is_none());
    }
}

mod args;

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::Parser;
use common::{
    error::AppError,
    utils::config::{get_config, AppConfig},
};
use ingestion_pipeline::{
    catalog::PrefixUsage,
    export::{write_item_records, write_storage_summary},
    list_sites, run_ingestion, summarize_storage, RunReport,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Cli, Command, IngestArgs, PrefixArgs, StorageArgs};

const EXIT_FATAL: u8 = 1;
const EXIT_CONTRADICTIONS: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

    let config = match get_config() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Could not load process configuration");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let result = match cli.command {
        Command::Ingest(args) => ingest(&config, &args).await,
        Command::Sites(args) => sites(&config, &args).await.map(|()| ExitCode::SUCCESS),
        Command::Storage(args) => storage(&config, &args).await.map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!(error = ?err, "warehouse-loader failed");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn ingest(config: &AppConfig, args: &IngestArgs) -> anyhow::Result<ExitCode> {
    let report = match run_ingestion(config, args.pipeline_config(config)).await {
        Ok(report) => report,
        Err(err) if err.is_fatal() => {
            error!(error = %err, "Ingestion run aborted");
            return Ok(ExitCode::from(EXIT_FATAL));
        }
        Err(err) => return Err(err.into()),
    };

    if !report.configured {
        warn!(run_id = %report.run_id, "Warehouse has no pipeline configuration; nothing was loaded");
    }
    if let Some(dir) = &args.export_dir {
        let path = export_report(dir, &report)?;
        info!(path = %path.display(), "Ingestion report written");
    }
    Ok(ExitCode::from(exit_status(&report)))
}

async fn sites(config: &AppConfig, args: &PrefixArgs) -> anyhow::Result<()> {
    let sites = list_sites(config, args.selection().as_ref())
        .await
        .map_err(fatal_context)?;
    for site in sites {
        println!("{site}");
    }
    Ok(())
}

async fn storage(config: &AppConfig, args: &StorageArgs) -> anyhow::Result<()> {
    let usage = summarize_storage(config, args.prefixes.clone())
        .await
        .map_err(fatal_context)?;
    for entry in &usage {
        println!("{}\t{}\t{}", entry.prefix, entry.total_bytes, entry.object_count);
    }
    if let Some(dir) = &args.export_dir {
        let path = export_storage(dir, &usage)?;
        info!(path = %path.display(), "Storage summary written");
    }
    Ok(())
}

fn fatal_context(err: AppError) -> anyhow::Error {
    anyhow::Error::new(err).context("reading the warehouse inventory")
}

fn exit_status(report: &RunReport) -> u8 {
    if report.has_contradictions() {
        warn!(
            run_id = %report.run_id,
            contradictions = report.contradictions(),
            "Run finished with partition contradictions; manual reconciliation needed"
        );
        EXIT_CONTRADICTIONS
    } else {
        0
    }
}

fn export_report(dir: &Path, report: &RunReport) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("ingestion.csv");
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    write_item_records(report, file)?;
    Ok(path)
}

fn export_storage(dir: &Path, usage: &[PrefixUsage]) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("storage.csv");
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    write_storage_summary(usage, file)?;
    Ok(path)
}

#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod catalog;
pub mod dicom;
pub mod export;
pub mod inventory;
pub mod keys;
pub mod patient_cache;
pub mod pipeline;
pub mod sites;
pub mod splitter;
pub mod types;
pub mod warehouse_config;

use std::{collections::BTreeSet, sync::Arc};

use common::{error::AppError, storage::store::StorageManager, utils::config::AppConfig};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    catalog::{FileCatalog, PrefixUsage},
    dicom::PartialDicomReader,
    inventory::InventoryReader,
    warehouse_config::WarehouseConfig,
};
pub use pipeline::{
    DefaultPipelineServices, IngestionConfig, IngestionPipeline, IngestionTuning, RunReport,
};

/// A catalog over the latest inventory report of the warehouse bucket.
pub async fn open_catalog(cfg: &AppConfig, prefetch: usize) -> Result<FileCatalog, AppError> {
    let inventory = StorageManager::new(cfg, &cfg.inventory_bucket_name()).await?;
    let reader = InventoryReader::open(inventory, &cfg.warehouse_bucket, prefetch).await?;
    Ok(FileCatalog::new(Arc::new(reader)))
}

/// One full ingestion run. Without a warehouse configuration the run is a
/// logged no-op and the inventory is never opened.
pub async fn run_ingestion(
    cfg: &AppConfig,
    pipeline_config: IngestionConfig,
) -> Result<RunReport, AppError> {
    let storage = StorageManager::new(cfg, &cfg.warehouse_bucket).await?;
    let Some(warehouse) = WarehouseConfig::load(&storage, &cfg.pipeline_config_key).await? else {
        return Ok(RunReport::unconfigured(
            Uuid::new_v4().to_string(),
            pipeline_config.dry_run,
        ));
    };
    if warehouse.raw_prefixes().is_empty() {
        warn!("Warehouse configuration lists no raw prefixes; nothing will be discovered");
    }

    let tuning = &pipeline_config.tuning;
    let catalog = open_catalog(cfg, tuning.inventory_prefetch).await?;
    let services =
        DefaultPipelineServices::new(storage, PartialDicomReader::new(tuning.initial_range_kb));
    let pipeline =
        IngestionPipeline::with_services(catalog, warehouse, pipeline_config, Arc::new(services));
    info!(run_id = %pipeline.run_id(), bucket = %cfg.warehouse_bucket, "Starting ingestion run");
    pipeline.run().await
}

/// Submitting sites named by the raw clinical records, narrowed to `only`.
pub async fn list_sites(
    cfg: &AppConfig,
    only: Option<&BTreeSet<String>>,
) -> Result<BTreeSet<String>, AppError> {
    let storage = StorageManager::new(cfg, &cfg.warehouse_bucket).await?;
    let Some(warehouse) = WarehouseConfig::load(&storage, &cfg.pipeline_config_key).await? else {
        return Ok(BTreeSet::new());
    };
    let catalog = open_catalog(cfg, cfg.inventory_prefetch).await?;
    let services = DefaultPipelineServices::new(storage, PartialDicomReader::new(cfg.initial_range_kb));
    sites::list_submitting_sites(
        &catalog,
        &services,
        &warehouse.selected_prefixes(only),
        cfg.ingest_concurrency,
    )
    .await
}

/// Storage usage per prefix, using the default lake prefixes when none are given.
pub async fn summarize_storage(
    cfg: &AppConfig,
    prefixes: Vec<String>,
) -> Result<Vec<PrefixUsage>, AppError> {
    let prefixes = if prefixes.is_empty() {
        catalog::default_summary_prefixes()
    } else {
        prefixes
    };
    let catalog = open_catalog(cfg, cfg.inventory_prefetch).await?;
    catalog.storage_summary(&prefixes).await
}

#[cfg(test)]
mod tests {
    use common::utils::config::StorageKind;

    use super::*;

    #[tokio::test]
    async fn missing_warehouse_configuration_is_a_no_op_run() {
        let cfg = AppConfig {
            storage: StorageKind::Memory,
            ..AppConfig::default()
        };
        let report = run_ingestion(
            &cfg,
            IngestionConfig {
                dry_run: true,
                ..IngestionConfig::default()
            },
        )
        .await
        .expect("no-op run");

        assert!(!report.configured);
        assert!(report.dry_run);
        assert_eq!(report.records().count(), 0);
        assert!(list_sites(&cfg, None).await.expect("sites").is_empty());
    }

    #[tokio::test]
    async fn storage_summary_needs_an_inventory() {
        let cfg = AppConfig {
            storage: StorageKind::Memory,
            ..AppConfig::default()
        };
        let err = summarize_storage(&cfg, Vec::new())
            .await
            .expect_err("no inventory");
        assert!(err.is_fatal());
    }
}

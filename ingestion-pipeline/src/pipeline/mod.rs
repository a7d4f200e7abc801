mod config;
mod context;
mod outcome;
mod services;
mod stages;
mod state;

pub use config::{IngestionConfig, IngestionTuning};
pub use outcome::{ItemOutcome, ItemRecord, RunReport, SkipReason, StreamReport};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices, SUBMITTING_SITE_FIELD};

use std::{collections::BTreeSet, sync::Arc, time::Instant};

use common::error::AppError;
use futures::{stream, StreamExt};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use self::{
    context::{PipelineContext, RunScope},
    stages::{classify, relocate, resolve, Flow},
    state::discovered,
};
use crate::{
    catalog::FileCatalog, patient_cache::PatientPartitionCache, warehouse_config::WarehouseConfig,
};

/// Moves pending raw files of the warehouse into the partitioned lake.
#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    run_id: String,
    pipeline_config: IngestionConfig,
    warehouse: WarehouseConfig,
    catalog: FileCatalog,
    cache: Arc<PatientPartitionCache>,
    services: Arc<dyn PipelineServices>,
}

impl IngestionPipeline {
    pub fn with_services(
        catalog: FileCatalog,
        warehouse: WarehouseConfig,
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            pipeline_config,
            warehouse,
            catalog,
            cache: Arc::new(PatientPartitionCache::new()),
            services,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cache(&self) -> &PatientPartitionCache {
        &self.cache
    }

    /// Seed the patient cache, then drain the clinical stream before the image
    /// stream starts.
    #[instrument(skip_all, fields(run_id = %self.run_id, dry_run = self.pipeline_config.dry_run))]
    pub async fn run(&self) -> Result<RunReport, AppError> {
        let started = Instant::now();
        let seed = self.cache.seed(&self.catalog).await?;
        let clinical = self.process_clinical_records().await?;
        let images = self.process_images().await?;

        let report = RunReport {
            run_id: self.run_id.clone(),
            dry_run: self.pipeline_config.dry_run,
            configured: true,
            seed,
            clinical,
            images,
        };
        info!(
            run_id = %self.run_id,
            total_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            clinical_processed = report.clinical.processed,
            images_processed = report.images.processed,
            skipped = report.clinical.skipped.saturating_add(report.images.skipped),
            failed = report.clinical.failed.saturating_add(report.images.failed),
            mutations = report.mutations(),
            planned = report.clinical.planned.saturating_add(report.images.planned),
            contradictions = report.contradictions(),
            "Ingestion run finished"
        );
        let conflicted = self.cache.conflicted();
        if !conflicted.is_empty() {
            warn!(
                run_id = %self.run_id,
                patients = ?conflicted,
                "Patients found in both partitions were left untouched"
            );
        }
        Ok(report)
    }

    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn process_clinical_records(&self) -> Result<StreamReport, AppError> {
        let keys = self.catalog.pending_raw_clinical(&self.prefixes()).await?;
        Ok(self.process_keys(keys).await)
    }

    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn process_images(&self) -> Result<StreamReport, AppError> {
        let pending = self.catalog.pending_raw_images(&self.prefixes()).await?;
        Ok(self.process_keys(pending.keys).await)
    }

    fn prefixes(&self) -> BTreeSet<String> {
        self.warehouse
            .selected_prefixes(self.pipeline_config.prefix_filter.as_ref())
    }

    async fn process_keys(&self, keys: Vec<String>) -> StreamReport {
        let scope = RunScope {
            run_id: &self.run_id,
            pipeline_config: &self.pipeline_config,
            warehouse: &self.warehouse,
            cache: &self.cache,
            services: self.services.as_ref(),
        };
        let scope = &scope;
        let records = stream::iter(keys)
            .map(|key| async move {
                let mut ctx = PipelineContext::new(scope, key);
                let outcome = match drive_item(&mut ctx).await {
                    Ok(outcome) => outcome,
                    Err(err) => ItemOutcome::Failed(ctx.abort(err)),
                };
                ctx.finish(&outcome)
            })
            .buffer_unordered(self.pipeline_config.tuning.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        StreamReport::from_records(records)
    }
}

async fn drive_item(ctx: &mut PipelineContext<'_>) -> Result<ItemOutcome, AppError> {
    let machine = discovered();
    let machine = match classify(machine, ctx)? {
        Flow::Continue(machine) => machine,
        Flow::Skip(reason) => return Ok(ItemOutcome::Skipped(reason)),
    };
    let machine = match resolve(machine, ctx).await? {
        Flow::Continue(machine) => machine,
        Flow::Skip(reason) => return Ok(ItemOutcome::Skipped(reason)),
    };
    let _machine = relocate(machine, ctx).await?;
    Ok(ItemOutcome::Processed)
}

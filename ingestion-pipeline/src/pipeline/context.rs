use bytes::Bytes;
use common::error::AppError;
use tracing::{debug, error, warn};

use super::{
    config::IngestionConfig,
    outcome::{ItemOutcome, ItemRecord, SkipReason},
    services::PipelineServices,
};
use crate::{
    keys::RawKind, patient_cache::PatientPartitionCache, types::Partition,
    warehouse_config::WarehouseConfig,
};

/// A mutation waiting for its final existence check.
#[derive(Debug, Clone)]
pub enum RelocationTask {
    Copy { destination: String },
    Upload { destination: String, document: Bytes },
}

impl RelocationTask {
    pub fn destination(&self) -> &str {
        match self {
            Self::Copy { destination } | Self::Upload { destination, .. } => destination,
        }
    }
}

/// Shared, read-mostly state of a run.
pub struct RunScope<'a> {
    pub run_id: &'a str,
    pub pipeline_config: &'a IngestionConfig,
    pub warehouse: &'a WarehouseConfig,
    pub cache: &'a PatientPartitionCache,
    pub services: &'a dyn PipelineServices,
}

pub struct PipelineContext<'a> {
    pub scope: &'a RunScope<'a>,
    pub key: String,
    pub kind: Option<RawKind>,
    pub pseudonym: Option<String>,
    pub partition: Option<Partition>,
    pub tasks: Vec<RelocationTask>,
    pub destinations: Vec<String>,
    pub copies: usize,
    pub uploads: usize,
    pub planned: usize,
}

impl<'a> PipelineContext<'a> {
    pub fn new(scope: &'a RunScope<'a>, key: String) -> Self {
        Self {
            scope,
            key,
            kind: None,
            pseudonym: None,
            partition: None,
            tasks: Vec::new(),
            destinations: Vec::new(),
            copies: 0,
            uploads: 0,
            planned: 0,
        }
    }

    pub fn services(&self) -> &'a dyn PipelineServices {
        self.scope.services
    }

    pub fn abort(&self, err: AppError) -> AppError {
        if err.is_integrity_violation() {
            error!(
                run_id = %self.scope.run_id,
                key = %self.key,
                error = %err,
                "Patient resolves to both partitions; manual reconciliation needed"
            );
        } else {
            error!(
                run_id = %self.scope.run_id,
                key = %self.key,
                error = %err,
                "Item failed; it will be retried on a future run"
            );
        }
        err
    }

    /// Log the outcome and turn the context into an export row.
    pub fn finish(self, outcome: &ItemOutcome) -> ItemRecord {
        if let ItemOutcome::Skipped(reason) = outcome {
            match reason {
                SkipReason::PartitionUnknown(_) => error!(
                    run_id = %self.scope.run_id,
                    key = %self.key,
                    reason = %reason,
                    "Image skipped until its clinical record is processed"
                ),
                SkipReason::MissingSite
                | SkipReason::UnknownSite(_)
                | SkipReason::MissingHeaderField(_)
                | SkipReason::UnparseableName
                | SkipReason::MissingDate => warn!(
                    run_id = %self.scope.run_id,
                    key = %self.key,
                    reason = %reason,
                    "Item skipped"
                ),
                SkipReason::Unrecognized | SkipReason::AlreadyProcessed => debug!(
                    run_id = %self.scope.run_id,
                    key = %self.key,
                    reason = %reason,
                    "Item skipped"
                ),
            }
        }

        ItemRecord {
            kind: self.kind.map(|kind| match kind {
                RawKind::Clinical => "clinical",
                RawKind::Image => "image",
            }),
            outcome: outcome.label(),
            reason: outcome.reason(),
            pseudonym: self.pseudonym,
            partition: self.partition.map(Partition::as_str),
            destinations: self.destinations.join(";"),
            copies: self.copies,
            uploads: self.uploads,
            planned: self.planned,
            contradiction: matches!(outcome, ItemOutcome::Failed(err) if err.is_integrity_violation()),
            key: self.key,
        }
    }
}

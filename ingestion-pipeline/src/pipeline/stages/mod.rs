use common::error::AppError;
use state_machines::core::GuardError;
use tracing::{debug, info, instrument};

use super::{
    context::{PipelineContext, RelocationTask},
    outcome::SkipReason,
    state::{Classified, Discovered, ItemMachine, Relocated, Resolved},
};
use crate::{
    dicom::scrub::metadata_document,
    keys::{
        classify_raw_key, clinical_destination, date_from_key, image_destinations,
        parse_clinical_name, ImageIdentity, RawKind,
    },
    splitter::is_training,
    types::{image_type_for_modality, Partition, SiteGroup},
};

/// Result of a stage that may leave the item where it is.
pub enum Flow<M> {
    Continue(M),
    Skip(SkipReason),
}

#[instrument(level = "trace", skip_all, fields(key = %ctx.key))]
pub fn classify(
    machine: ItemMachine<(), Discovered>,
    ctx: &mut PipelineContext<'_>,
) -> Result<Flow<ItemMachine<(), Classified>>, AppError> {
    let Some(kind) = classify_raw_key(&ctx.key) else {
        return Ok(Flow::Skip(SkipReason::Unrecognized));
    };
    ctx.kind = Some(kind);

    machine
        .classify()
        .map(Flow::Continue)
        .map_err(|(_, guard)| map_guard_error("classify", &guard))
}

/// Work out the destinations of the item and queue the missing ones.
#[instrument(level = "trace", skip_all, fields(key = %ctx.key))]
pub async fn resolve(
    machine: ItemMachine<(), Classified>,
    ctx: &mut PipelineContext<'_>,
) -> Result<Flow<ItemMachine<(), Resolved>>, AppError> {
    let skipped = match ctx.kind {
        Some(RawKind::Clinical) => resolve_clinical(ctx).await?,
        Some(RawKind::Image) => resolve_image(ctx).await?,
        None => Some(SkipReason::Unrecognized),
    };
    if let Some(reason) = skipped {
        return Ok(Flow::Skip(reason));
    }
    if ctx.tasks.is_empty() {
        return Ok(Flow::Skip(SkipReason::AlreadyProcessed));
    }

    machine
        .resolve()
        .map(Flow::Continue)
        .map_err(|(_, guard)| map_guard_error("resolve", &guard))
}

async fn resolve_clinical(ctx: &mut PipelineContext<'_>) -> Result<Option<SkipReason>, AppError> {
    let Some((pseudonym, outcome)) = parse_clinical_name(&ctx.key) else {
        return Ok(Some(SkipReason::UnparseableName));
    };
    let Some(date) = date_from_key(&ctx.key).map(str::to_string) else {
        return Ok(Some(SkipReason::MissingDate));
    };
    ctx.pseudonym = Some(pseudonym.clone());

    let scope = ctx.scope;
    let partition = match scope.cache.lookup(&pseudonym)? {
        Some(partition) => partition,
        None => {
            let Some(site) = ctx.services().read_submitting_site(&ctx.key).await? else {
                return Ok(Some(SkipReason::MissingSite));
            };
            let partition = match scope.warehouse.site_group(&site) {
                Some(SiteGroup::Training) => Partition::Training,
                Some(SiteGroup::Validation) => Partition::Validation,
                Some(SiteGroup::Split) => Partition::from_is_training(is_training(
                    &pseudonym,
                    scope.warehouse.split_percentage(),
                )),
                None => return Ok(Some(SkipReason::UnknownSite(site))),
            };
            scope.cache.add(&pseudonym, partition)?;
            debug!(%pseudonym, %site, %partition, "Patient assigned to partition");
            partition
        }
    };
    ctx.partition = Some(partition);

    let destination = clinical_destination(partition, &pseudonym, outcome, &date);
    queue_if_missing(ctx, RelocationTask::Copy { destination }).await?;
    Ok(None)
}

async fn resolve_image(ctx: &mut PipelineContext<'_>) -> Result<Option<SkipReason>, AppError> {
    let header = ctx.services().read_image_header(&ctx.key).await?;
    let Some(patient_id) = header.patient_id() else {
        return Ok(Some(SkipReason::MissingHeaderField("PatientID")));
    };
    ctx.pseudonym = Some(patient_id.to_string());
    let Some(study_id) = header.study_instance_uid() else {
        return Ok(Some(SkipReason::MissingHeaderField("StudyInstanceUID")));
    };
    let Some(series_id) = header.series_instance_uid() else {
        return Ok(Some(SkipReason::MissingHeaderField("SeriesInstanceUID")));
    };

    let Some(partition) = ctx.scope.cache.lookup(patient_id)? else {
        return Ok(Some(SkipReason::PartitionUnknown(patient_id.to_string())));
    };
    ctx.partition = Some(partition);

    let identity = ImageIdentity {
        partition,
        image_type: image_type_for_modality(header.modality().unwrap_or_default()),
        patient_id,
        study_id,
        series_id,
    };
    let Some(destinations) = image_destinations(&identity, &ctx.key) else {
        return Ok(Some(SkipReason::UnparseableName));
    };

    queue_if_missing(
        ctx,
        RelocationTask::Copy {
            destination: destinations.image_key,
        },
    )
    .await?;
    if !ctx.services().exists(&destinations.metadata_key).await? {
        ctx.destinations.push(destinations.metadata_key.clone());
        ctx.tasks.push(RelocationTask::Upload {
            destination: destinations.metadata_key,
            document: metadata_document(&header)?,
        });
    }
    Ok(None)
}

async fn queue_if_missing(
    ctx: &mut PipelineContext<'_>,
    task: RelocationTask,
) -> Result<(), AppError> {
    if !ctx.services().exists(task.destination()).await? {
        ctx.destinations.push(task.destination().to_string());
        ctx.tasks.push(task);
    }
    Ok(())
}

/// Perform the queued mutations, each guarded by a fresh existence check.
#[instrument(level = "trace", skip_all, fields(key = %ctx.key))]
pub async fn relocate(
    machine: ItemMachine<(), Resolved>,
    ctx: &mut PipelineContext<'_>,
) -> Result<ItemMachine<(), Relocated>, AppError> {
    let services = ctx.services();
    let dry_run = ctx.scope.pipeline_config.dry_run;

    for task in std::mem::take(&mut ctx.tasks) {
        let destination = task.destination();
        if services.exists(destination).await? {
            debug!(key = %ctx.key, destination, "Destination appeared meanwhile; leaving it");
            continue;
        }
        if dry_run {
            match &task {
                RelocationTask::Copy { .. } => {
                    info!(key = %ctx.key, destination, "Dry run: would copy");
                }
                RelocationTask::Upload { document, .. } => {
                    info!(key = %ctx.key, destination, bytes = document.len(), "Dry run: would upload");
                }
            }
            ctx.planned = ctx.planned.saturating_add(1);
            continue;
        }
        match task {
            RelocationTask::Copy { ref destination } => {
                services.copy(&ctx.key, destination).await?;
                ctx.copies = ctx.copies.saturating_add(1);
                info!(key = %ctx.key, %destination, "Copied");
            }
            RelocationTask::Upload {
                ref destination,
                document,
            } => {
                services.upload(destination, document).await?;
                ctx.uploads = ctx.uploads.saturating_add(1);
                info!(key = %ctx.key, %destination, "Uploaded metadata");
            }
        }
    }

    machine
        .relocate()
        .map_err(|(_, guard)| map_guard_error("relocate", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid item pipeline transition during {event}: {guard:?}"
    ))
}

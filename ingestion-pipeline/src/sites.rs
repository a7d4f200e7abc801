use std::collections::BTreeSet;

use common::error::AppError;
use futures::{stream, StreamExt};
use tracing::{info, instrument, warn};

use crate::{catalog::FileCatalog, pipeline::PipelineServices};

/// Every distinct submitting site named by the raw clinical records under
/// `raw_prefixes`. Records that cannot be read are logged and left out.
#[instrument(skip_all, fields(prefixes = raw_prefixes.len()))]
pub async fn list_submitting_sites(
    catalog: &FileCatalog,
    services: &dyn PipelineServices,
    raw_prefixes: &BTreeSet<String>,
    concurrency: usize,
) -> Result<BTreeSet<String>, AppError> {
    let keys = catalog.pending_raw_clinical(raw_prefixes).await?;
    let record_count = keys.len();

    let sites: BTreeSet<String> = stream::iter(keys)
        .map(|key| async move {
            match services.read_submitting_site(&key).await {
                Ok(site) => site,
                Err(err) => {
                    warn!(%key, error = %err, "Could not read submitting site");
                    None
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|site| async move { site })
        .collect()
        .await;

    info!(records = record_count, sites = sites.len(), "Submitting sites listed");
    Ok(sites)
}

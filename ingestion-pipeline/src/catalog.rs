use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use common::error::AppError;
use futures::TryStreamExt;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{
    inventory::InventoryReader,
    keys::{compile, metadata_name},
    types::Partition,
};

static PROCESSED_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"^(?:training|validation)/(?:xray|ct|mri|unknown)(?:-metadata)?/.+/(?P<filename>[^/]+)$")
});

static PROCESSED_CLINICAL: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"^(?P<partition>training|validation)/data/(?P<pseudonym>[^/]+)/[^/]+$")
});

/// A clinical record already in the lake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedClinical {
    pub key: String,
    pub pseudonym: String,
    pub partition: Partition,
}

/// Result of the raw-versus-processed image diff.
#[derive(Debug, Default)]
pub struct PendingImages {
    /// Raw image keys whose image copy or metadata document is missing.
    pub keys: Vec<String>,
    /// Fragments found to hold no processed images.
    pub excluded_fragments: HashSet<usize>,
    /// Fragments downloaded while looking for processed images.
    pub processed_fragment_reads: usize,
}

/// Bytes and objects stored under one key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixUsage {
    pub prefix: String,
    pub total_bytes: u64,
    pub object_count: u64,
}

/// The storage prefixes reported when none are requested.
pub fn default_summary_prefixes() -> Vec<String> {
    let mut prefixes = Vec::new();
    for partition in [Partition::Training, Partition::Validation] {
        prefixes.push(format!("{partition}/"));
        for image_type in ["ct", "mri", "xray"] {
            prefixes.push(format!("{partition}/{image_type}/"));
        }
    }
    prefixes
}

/// Semantic views over the warehouse inventory.
#[derive(Clone)]
pub struct FileCatalog {
    inventory: Arc<InventoryReader>,
}

impl FileCatalog {
    pub fn new(inventory: Arc<InventoryReader>) -> Self {
        Self { inventory }
    }

    /// Raw clinical records (`<prefix>/<date>/data/<pseudonym>_(data|status).json`).
    #[instrument(skip_all, fields(prefixes = raw_prefixes.len()))]
    pub async fn pending_raw_clinical(
        &self,
        raw_prefixes: &BTreeSet<String>,
    ) -> Result<Vec<String>, AppError> {
        let Some(pattern) = raw_pattern(raw_prefixes, r"data/[^/]+_(?:data|status)\.json")
        else {
            return Ok(Vec::new());
        };

        let mut keys = Vec::new();
        let mut fragments = self.inventory.all_fragments();
        while let Some(fragment) = fragments.try_next().await? {
            for row in fragment.rows() {
                let row = row?;
                if pattern.is_match(&row.key) {
                    keys.push(row.key);
                }
            }
        }
        info!(count = keys.len(), "Raw clinical records found");
        Ok(keys)
    }

    /// Raw images that still need copying or a metadata document.
    ///
    /// Each fragment holding raw images is diffed against the processed
    /// images of every other fragment. Fragments found without processed
    /// images are skipped by later diffs of the same call.
    #[instrument(skip_all, fields(prefixes = raw_prefixes.len()))]
    pub async fn pending_raw_images(
        &self,
        raw_prefixes: &BTreeSet<String>,
    ) -> Result<PendingImages, AppError> {
        let mut result = PendingImages::default();
        let Some(pattern) = raw_pattern(raw_prefixes, r"images/(?P<filename>[^/]+\.(?i:dcm))")
        else {
            return Ok(result);
        };

        let mut batches = self.inventory.all_fragments();
        while let Some(batch) = batches.try_next().await? {
            let mut raw_keys: HashMap<String, Vec<String>> = HashMap::new();
            for row in batch.rows() {
                let row = row?;
                if let Some(filename) = pattern.captures(&row.key).and_then(|c| c.name("filename")) {
                    let filename = filename.as_str().to_string();
                    raw_keys.entry(filename).or_default().push(row.key);
                }
            }
            if raw_keys.is_empty() {
                continue;
            }

            let mut missing_images: HashSet<String> = raw_keys.keys().cloned().collect();
            let mut missing_metadata: HashMap<String, String> = raw_keys
                .keys()
                .map(|name| (metadata_name(name), name.clone()))
                .collect();

            let mut newly_excluded = Vec::new();
            let mut processed = self.inventory.fragments(&result.excluded_fragments);
            while let Some(candidate) = processed.try_next().await? {
                result.processed_fragment_reads = result.processed_fragment_reads.saturating_add(1);
                let mut matched = false;
                for row in candidate.rows() {
                    let row = row?;
                    if let Some(filename) =
                        PROCESSED_IMAGE.captures(&row.key).and_then(|c| c.name("filename"))
                    {
                        matched = true;
                        missing_images.remove(filename.as_str());
                        missing_metadata.remove(filename.as_str());
                    }
                }
                if !matched {
                    newly_excluded.push(candidate.index);
                }
                if missing_images.is_empty() && missing_metadata.is_empty() {
                    debug!(batch = batch.index, "Every raw image of the batch is processed");
                    break;
                }
            }
            drop(processed);
            result.excluded_fragments.extend(newly_excluded);

            let pending: BTreeSet<String> = missing_images
                .into_iter()
                .chain(missing_metadata.into_values())
                .collect();
            debug!(
                batch = batch.index,
                raw = raw_keys.len(),
                pending = pending.len(),
                "Raw image batch diffed"
            );
            for name in pending {
                if let Some(keys) = raw_keys.remove(&name) {
                    result.keys.extend(keys);
                }
            }
        }

        info!(
            count = result.keys.len(),
            excluded_fragments = result.excluded_fragments.len(),
            processed_fragment_reads = result.processed_fragment_reads,
            "Pending raw images found"
        );
        Ok(result)
    }

    /// Clinical records already filed under a partition.
    #[instrument(skip_all)]
    pub async fn processed_clinical(&self) -> Result<Vec<ProcessedClinical>, AppError> {
        let mut records = Vec::new();
        let mut fragments = self.inventory.all_fragments();
        while let Some(fragment) = fragments.try_next().await? {
            for row in fragment.rows() {
                let row = row?;
                let Some(caps) = PROCESSED_CLINICAL.captures(&row.key) else {
                    continue;
                };
                let partition = caps.name("partition").and_then(|m| Partition::parse(m.as_str()));
                let pseudonym = caps.name("pseudonym").map(|m| m.as_str().to_string());
                if let (Some(partition), Some(pseudonym)) = (partition, pseudonym) {
                    records.push(ProcessedClinical {
                        key: row.key.clone(),
                        pseudonym,
                        partition,
                    });
                }
            }
        }
        info!(count = records.len(), "Processed clinical records found");
        Ok(records)
    }

    /// Total size and object count under each prefix, in one inventory pass.
    #[instrument(skip_all, fields(prefixes = prefixes.len()))]
    pub async fn storage_summary(&self, prefixes: &[String]) -> Result<Vec<PrefixUsage>, AppError> {
        let mut usage: Vec<PrefixUsage> = prefixes
            .iter()
            .map(|prefix| PrefixUsage {
                prefix: prefix.clone(),
                total_bytes: 0,
                object_count: 0,
            })
            .collect();

        let mut fragments = self.inventory.all_fragments();
        while let Some(fragment) = fragments.try_next().await? {
            for row in fragment.rows() {
                let row = row?;
                for entry in usage.iter_mut().filter(|u| row.key.starts_with(&u.prefix)) {
                    entry.total_bytes = entry.total_bytes.saturating_add(row.size.unwrap_or(0));
                    entry.object_count = entry.object_count.saturating_add(1);
                }
            }
        }
        Ok(usage)
    }
}

/// `^(<p1>|<p2>|...)/<date>/<tail>$`, or `None` when no prefix is selected.
fn raw_pattern(raw_prefixes: &BTreeSet<String>, tail: &str) -> Option<Regex> {
    if raw_prefixes.is_empty() {
        return None;
    }
    let alternatives: Vec<String> = raw_prefixes.iter().map(|p| regex::escape(p)).collect();
    Some(compile(&format!(
        r"^(?:{})/\d{{4}}-\d{{2}}-\d{{2}}/{tail}$",
        alternatives.join("|")
    )))
}

//! Reader for the daily bulk inventory reports of the warehouse bucket.
//!
//! The inventory store keeps, under `<bucket>/daily-full-inventory/hive/`, one
//! `symlink.txt` manifest per report. Each manifest lists gzip-compressed CSV
//! fragments whose rows are `bucket,key,size,...`.

use std::collections::HashSet;

use bytes::Bytes;
use common::{error::AppError, storage::store::StorageManager};
use flate2::read::GzDecoder;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info};

pub const INVENTORY_ROOT: &str = "daily-full-inventory/hive";
const MANIFEST_NAME: &str = "symlink.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRow {
    pub bucket: String,
    pub key: String,
    pub size: Option<u64>,
}

impl InventoryRow {
    fn from_record(record: &csv::StringRecord) -> Option<Self> {
        let key = record.get(1)?;
        if key.is_empty() {
            return None;
        }
        Some(Self {
            bucket: record.get(0).unwrap_or_default().to_string(),
            key: key.to_string(),
            size: record.get(2).and_then(|size| size.trim().parse().ok()),
        })
    }
}

/// One downloaded, still compressed, inventory fragment.
pub struct InventoryFragment {
    pub index: usize,
    pub location: String,
    data: Bytes,
}

impl InventoryFragment {
    pub fn new(index: usize, location: String, data: Bytes) -> Self {
        Self {
            index,
            location,
            data,
        }
    }

    /// Decompress and parse rows lazily.
    pub fn rows(&self) -> impl Iterator<Item = Result<InventoryRow, AppError>> + '_ {
        let location = self.location.as_str();
        csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(GzDecoder::new(self.data.as_ref()))
            .into_records()
            .map(move |record| {
                let record = record
                    .map_err(|e| AppError::InventoryFormat(format!("{location}: {e}")))?;
                InventoryRow::from_record(&record).ok_or_else(|| {
                    AppError::InventoryFormat(format!("{location}: row without an object key"))
                })
            })
    }
}

pub struct InventoryReader {
    storage: StorageManager,
    fragments: Vec<String>,
    prefetch: usize,
}

impl InventoryReader {
    /// Locate the latest report for `source_bucket` in the inventory store.
    ///
    /// Fails with [`AppError::InventoryUnavailable`] when no manifest exists:
    /// without an inventory nothing can be discovered.
    pub async fn open(
        storage: StorageManager,
        source_bucket: &str,
        prefetch: usize,
    ) -> Result<Self, AppError> {
        let fragments = Self::latest_manifest(&storage, source_bucket).await?;
        info!(
            inventory_bucket = %storage.bucket(),
            fragment_count = fragments.len(),
            "Using inventory report"
        );
        Ok(Self {
            storage,
            fragments,
            prefetch: prefetch.max(1),
        })
    }

    /// Fragment locations listed in the most recent manifest, in manifest order.
    pub async fn latest_manifest(
        storage: &StorageManager,
        source_bucket: &str,
    ) -> Result<Vec<String>, AppError> {
        let prefix = format!("{source_bucket}/{INVENTORY_ROOT}");
        let listing = storage.list(Some(&prefix)).await.map_err(|e| {
            AppError::InventoryUnavailable(format!("cannot list {prefix}: {e}"))
        })?;

        let latest = listing
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| key.ends_with(MANIFEST_NAME))
            .max()
            .ok_or_else(|| {
                AppError::InventoryUnavailable(format!("no inventory manifest under {prefix}"))
            })?;
        debug!(manifest = %latest, "Latest inventory manifest");

        let body = storage.get(&latest).await.map_err(|e| {
            AppError::InventoryUnavailable(format!("cannot read manifest {latest}: {e}"))
        })?;
        let text = String::from_utf8_lossy(&body);
        let bucket_url = format!("s3://{}/", storage.bucket());
        let fragments: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.strip_prefix(&bucket_url).unwrap_or(line).to_string())
            .collect();

        if fragments.is_empty() {
            return Err(AppError::InventoryUnavailable(format!(
                "manifest {latest} lists no fragments"
            )));
        }
        Ok(fragments)
    }

    /// Stream every fragment not listed in `exclude`, in manifest order.
    ///
    /// Up to `prefetch` downloads run ahead of the consumer. Rows are only
    /// decompressed when the consumer iterates [`InventoryFragment::rows`].
    pub fn fragments(
        &self,
        exclude: &HashSet<usize>,
    ) -> BoxStream<'_, Result<InventoryFragment, AppError>> {
        let wanted: Vec<(usize, &str)> = self
            .fragments
            .iter()
            .enumerate()
            .filter(|(index, location)| {
                let skip = exclude.contains(index);
                if skip {
                    debug!(index, location = %location, "Skipping inventory fragment as requested");
                }
                !skip
            })
            .map(|(index, location)| (index, location.as_str()))
            .collect();

        stream::iter(wanted)
            .map(move |(index, location)| self.fetch(index, location))
            .buffered(self.prefetch)
            .boxed()
    }

    pub fn all_fragments(&self) -> BoxStream<'_, Result<InventoryFragment, AppError>> {
        self.fragments(&HashSet::new())
    }

    async fn fetch(&self, index: usize, location: &str) -> Result<InventoryFragment, AppError> {
        debug!(index, location, "Downloading inventory fragment");
        let data = self.storage.get(location).await.map_err(|e| {
            AppError::InventoryUnavailable(format!("cannot download fragment {location}: {e}"))
        })?;
        Ok(InventoryFragment::new(index, location.to_string(), data))
    }
}

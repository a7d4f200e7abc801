use std::collections::{BTreeSet, HashMap};

use common::{error::AppError, storage::store::StorageManager};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::SiteGroup;

pub const DEFAULT_TRAINING_PERCENTAGE: i64 = 0;

#[derive(Debug, Default, Deserialize)]
struct SiteLists {
    #[serde(default)]
    split: Vec<String>,
    #[serde(default)]
    training: Vec<String>,
    #[serde(default)]
    validation: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawWarehouseConfig {
    #[serde(default)]
    raw_prefixes: Vec<String>,
    #[serde(default = "default_training_percentage")]
    training_percentage: i64,
    #[serde(default)]
    sites: SiteLists,
}

fn default_training_percentage() -> i64 {
    DEFAULT_TRAINING_PERCENTAGE
}

/// The warehouse's own ingestion settings, kept as a JSON object in the bucket:
///
/// ```json
/// {"raw_prefixes": ["raw-site-a"], "training_percentage": 70,
///  "sites": {"split": ["A"], "training": ["B"], "validation": ["C"]}}
/// ```
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    raw_prefixes: BTreeSet<String>,
    training_percentage: u8,
    sites: HashMap<String, SiteGroup>,
}

impl WarehouseConfig {
    /// Load the configuration object. A missing object is reported as `Ok(None)`.
    pub async fn load(storage: &StorageManager, key: &str) -> Result<Option<Self>, AppError> {
        match storage.get(key).await {
            Ok(bytes) => Self::from_json(&bytes).map(Some),
            Err(object_store::Error::NotFound { .. }) => {
                warn!(
                    bucket = %storage.bucket(),
                    key,
                    "No configuration found in the bucket; nothing will be loaded"
                );
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, AppError> {
        let raw: RawWarehouseConfig = serde_json::from_slice(bytes)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawWarehouseConfig) -> Self {
        let raw_prefixes: BTreeSet<String> = raw
            .raw_prefixes
            .iter()
            .map(|prefix| prefix.trim_end_matches('/').to_string())
            .filter(|prefix| !prefix.is_empty())
            .collect();

        let clamped = raw.training_percentage.clamp(0, 100);
        if clamped != raw.training_percentage {
            warn!(
                configured = raw.training_percentage,
                clamped, "Training percentage out of range; clamping"
            );
        }
        let training_percentage = u8::try_from(clamped).unwrap_or(100);

        let mut sites = HashMap::new();
        let groups = [
            (SiteGroup::Split, raw.sites.split),
            (SiteGroup::Training, raw.sites.training),
            (SiteGroup::Validation, raw.sites.validation),
        ];
        for (group, names) in groups {
            for site in names {
                if let Some(previous) = sites.insert(site.clone(), group) {
                    if previous != group {
                        warn!(%site, ?previous, ?group, "Site listed in several groups; last one wins");
                    }
                }
            }
        }

        debug!(
            training_percentage,
            site_count = sites.len(),
            prefix_count = raw_prefixes.len(),
            "Warehouse configuration loaded"
        );

        Self {
            raw_prefixes,
            training_percentage,
            sites,
        }
    }

    pub fn site_group(&self, site: &str) -> Option<SiteGroup> {
        self.sites.get(site).copied()
    }

    pub fn split_percentage(&self) -> u8 {
        self.training_percentage
    }

    pub fn raw_prefixes(&self) -> &BTreeSet<String> {
        &self.raw_prefixes
    }

    /// Configured prefixes, narrowed to `only` when given.
    pub fn selected_prefixes(&self, only: Option<&BTreeSet<String>>) -> BTreeSet<String> {
        match only {
            Some(only) => {
                let wanted: BTreeSet<String> = only
                    .iter()
                    .map(|prefix| prefix.trim_end_matches('/').to_string())
                    .collect();
                for prefix in wanted.difference(&self.raw_prefixes) {
                    warn!(%prefix, "Requested raw prefix is not configured; ignoring");
                }
                self.raw_prefixes.intersection(&wanted).cloned().collect()
            }
            None => self.raw_prefixes.clone(),
        }
    }
}

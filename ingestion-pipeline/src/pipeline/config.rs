use std::collections::BTreeSet;

use common::utils::config::AppConfig;

use crate::dicom::partial::DEFAULT_INITIAL_RANGE_KB;

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    /// Keys processed at the same time within one stream.
    pub concurrency: usize,
    pub initial_range_kb: usize,
    pub inventory_prefetch: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            concurrency: 8,
            initial_range_kb: DEFAULT_INITIAL_RANGE_KB,
            inventory_prefetch: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    /// Log mutations instead of performing them.
    pub dry_run: bool,
    /// Restrict the run to these raw prefixes.
    pub prefix_filter: Option<BTreeSet<String>>,
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tuning: IngestionTuning {
                concurrency: config.ingest_concurrency.max(1),
                initial_range_kb: config.initial_range_kb.max(1),
                inventory_prefetch: config.inventory_prefetch.max(1),
            },
            dry_run: config.dry_run,
            prefix_filter: None,
        }
    }
}

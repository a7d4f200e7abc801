use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    S3,
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::S3
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_warehouse_bucket")]
    pub warehouse_bucket: String,
    /// Defaults to `<warehouse_bucket>-inventory` when unset.
    #[serde(default)]
    pub inventory_bucket: Option<String>,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_pipeline_config_key")]
    pub pipeline_config_key: String,
    #[serde(default = "default_ingest_concurrency")]
    pub ingest_concurrency: usize,
    #[serde(default = "default_initial_range_kb")]
    pub initial_range_kb: usize,
    #[serde(default = "default_inventory_prefetch")]
    pub inventory_prefetch: usize,
    #[serde(default = "default_storage_retry_attempts")]
    pub storage_retry_attempts: usize,
    #[serde(default = "default_storage_retry_base_ms")]
    pub storage_retry_base_ms: u64,
}

impl AppConfig {
    pub fn inventory_bucket_name(&self) -> String {
        self.inventory_bucket
            .clone()
            .unwrap_or_else(|| format!("{}-inventory", self.warehouse_bucket))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            warehouse_bucket: default_warehouse_bucket(),
            inventory_bucket: None,
            storage: default_storage_kind(),
            data_dir: default_data_dir(),
            dry_run: false,
            pipeline_config_key: default_pipeline_config_key(),
            ingest_concurrency: default_ingest_concurrency(),
            initial_range_kb: default_initial_range_kb(),
            inventory_prefetch: default_inventory_prefetch(),
            storage_retry_attempts: default_storage_retry_attempts(),
            storage_retry_base_ms: default_storage_retry_base_ms(),
        }
    }
}

fn default_warehouse_bucket() -> String {
    "chest-data-warehouse".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_pipeline_config_key() -> String {
    "config.json".to_string()
}

fn default_ingest_concurrency() -> usize {
    8
}

fn default_initial_range_kb() -> usize {
    20
}

fn default_inventory_prefetch() -> usize {
    2
}

fn default_storage_retry_attempts() -> usize {
    3
}

fn default_storage_retry_base_ms() -> u64 {
    100
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("warehouse-loader").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_bucket_defaults_to_suffixed_warehouse_bucket() {
        let cfg = AppConfig {
            warehouse_bucket: "scans".into(),
            ..Default::default()
        };
        assert_eq!(cfg.inventory_bucket_name(), "scans-inventory");

        let cfg = AppConfig {
            inventory_bucket: Some("elsewhere".into()),
            ..cfg
        };
        assert_eq!(cfg.inventory_bucket_name(), "elsewhere");
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.storage, StorageKind::S3);
        assert_eq!(cfg.pipeline_config_key, "config.json");
        assert_eq!(cfg.initial_range_kb, 20);
        assert!(!cfg.dry_run);
    }
}

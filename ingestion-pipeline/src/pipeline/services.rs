use async_trait::async_trait;
use bytes::Bytes;
use common::{error::AppError, storage::store::StorageManager};
use serde_json::Value;
use tracing::debug;

use crate::dicom::{DicomHeader, PartialDicomReader};

/// Field of a clinical record naming the hospital that submitted it.
pub const SUBMITTING_SITE_FIELD: &str = "SubmittingCentre";

/// Everything the orchestrator needs from the warehouse bucket.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, AppError>;

    /// Submitting site of a clinical record, `None` when the field is absent or blank.
    async fn read_submitting_site(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn read_image_header(&self, key: &str) -> Result<DicomHeader, AppError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), AppError>;

    async fn upload(&self, key: &str, document: Bytes) -> Result<(), AppError>;
}

pub struct DefaultPipelineServices {
    storage: StorageManager,
    header_reader: PartialDicomReader,
}

impl DefaultPipelineServices {
    pub fn new(storage: StorageManager, header_reader: PartialDicomReader) -> Self {
        Self {
            storage,
            header_reader,
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.storage.exists(key).await?)
    }

    async fn read_submitting_site(&self, key: &str) -> Result<Option<String>, AppError> {
        let body = self.storage.get(key).await?;
        let record: Value = serde_json::from_slice(&body)?;
        Ok(submitting_site(&record))
    }

    async fn read_image_header(&self, key: &str) -> Result<DicomHeader, AppError> {
        self.header_reader.read(&self.storage, key).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), AppError> {
        Ok(self.storage.copy(from, to).await?)
    }

    async fn upload(&self, key: &str, document: Bytes) -> Result<(), AppError> {
        if !self.storage.put_if_absent(key, document).await? {
            debug!(key, "Metadata document already present; left as is");
        }
        Ok(())
    }
}

pub(crate) fn submitting_site(record: &Value) -> Option<String> {
    record
        .get(SUBMITTING_SITE_FIELD)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|site| !site.is_empty())
        .map(str::to_string)
}

use std::future::Future;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, GetOptions, GetRange, ObjectStore, PutMode};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::warn;

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Backoff applied to transient object store failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            attempts: cfg.storage_retry_attempts,
            base_delay_ms: cfg.storage_retry_base_ms,
        }
    }

    fn strategy(self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms.max(1))
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 100,
        }
    }
}

/// Handle on a single bucket of the backing object store.
///
/// All operations address objects by their bucket-relative key. Transient
/// failures are retried according to the configured [`RetryPolicy`].
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
    bucket: String,
    retry: RetryPolicy,
}

impl StorageManager {
    /// Create a new StorageManager for `bucket` using the configured backend.
    pub async fn new(cfg: &AppConfig, bucket: &str) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let store = create_storage_backend(cfg, bucket).await?;

        Ok(Self {
            store,
            backend_kind,
            bucket: bucket.to_string(),
            retry: RetryPolicy::from_config(cfg),
        })
    }

    /// Create a StorageManager with a custom storage backend.
    ///
    /// Useful in tests that need to share one backend between several handles.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind, bucket: &str) -> Self {
        Self {
            store,
            backend_kind,
            bucket: bucket.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Store bytes at the specified location, replacing anything already there.
    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        self.with_retry("put", location, || {
            let payload = object_store::PutPayload::from_bytes(data.clone());
            let path = &path;
            async move { self.store.put(path, payload).await.map(|_| ()) }
        })
        .await
    }

    /// Store bytes at `location` unless an object is already there.
    ///
    /// Returns `false` when the object existed. Backends without conditional
    /// writes fall back to a head request before the put.
    pub async fn put_if_absent(&self, location: &str, data: Bytes) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        let created = self
            .with_retry("put_if_absent", location, || {
                let payload = object_store::PutPayload::from_bytes(data.clone());
                let path = &path;
                async move {
                    self.store
                        .put_opts(path, payload, PutMode::Create.into())
                        .await
                        .map(|_| ())
                }
            })
            .await;
        match created {
            Ok(()) => Ok(true),
            Err(
                object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. },
            ) => Ok(false),
            Err(object_store::Error::NotImplemented) => {
                if self.exists(location).await? {
                    return Ok(false);
                }
                self.put(location, data).await.map(|()| true)
            }
            Err(err) => Err(err),
        }
    }

    /// Retrieve the full contents of an object.
    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        self.with_retry("get", location, || {
            let path = &path;
            async move { self.store.get(path).await?.bytes().await }
        })
        .await
    }

    /// Retrieve the bytes in `range`.
    ///
    /// Ranges extending past the end of the object are clamped, so the result
    /// may be shorter than requested.
    pub async fn get_range(
        &self,
        location: &str,
        range: Range<usize>,
    ) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        self.with_retry("get_range", location, || {
            let options = GetOptions {
                range: Some(GetRange::Bounded(range.clone())),
                ..GetOptions::default()
            };
            let path = &path;
            async move { self.store.get_opts(path, options).await?.bytes().await }
        })
        .await
    }

    /// Server-side copy within the bucket. Overwrites `to` if present.
    pub async fn copy(&self, from: &str, to: &str) -> object_store::Result<()> {
        let source = ObjPath::from(from);
        let destination = ObjPath::from(to);
        self.with_retry("copy", to, || self.store.copy(&source, &destination))
            .await
    }

    /// List all objects below the specified prefix.
    pub async fn list(
        &self,
        prefix: Option<&str>,
    ) -> object_store::Result<Vec<object_store::ObjectMeta>> {
        let prefix_path = prefix.map(ObjPath::from);
        self.with_retry("list", prefix.unwrap_or_default(), || {
            self.store.list(prefix_path.as_ref()).try_collect::<Vec<_>>()
        })
        .await
    }

    /// Check if an object exists at the specified location.
    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.with_retry("head", location, || self.store.head(&path))
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        location: &str,
        action: F,
    ) -> object_store::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        RetryIf::spawn(self.retry.strategy(), action, |err: &object_store::Error| {
            let transient = is_transient(err);
            if transient {
                warn!(
                    bucket = %self.bucket,
                    operation,
                    location,
                    error = %err,
                    "Transient object store failure; retrying"
                );
            }
            transient
        })
        .await
    }
}

fn is_transient(err: &object_store::Error) -> bool {
    !matches!(
        err,
        object_store::Error::NotFound { .. }
            | object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. }
            | object_store::Error::NotModified { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::UnknownConfigurationKey { .. }
    )
}

/// Create a storage backend for one bucket based on configuration.
async fn create_storage_backend(cfg: &AppConfig, bucket: &str) -> object_store::Result<DynStore> {
    match cfg.storage {
        StorageKind::S3 => {
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_conditional_put(S3ConditionalPut::ETagMatch)
                .build()?;
            Ok(Arc::new(store))
        }
        StorageKind::Local => {
            let base = resolve_base_dir(cfg).join(bucket);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base)?;
            Ok(Arc::new(store))
        }
        StorageKind::Memory => Ok(Arc::new(InMemory::new())),
    }
}

/// Resolve the absolute base directory used for local storage from config.
///
/// If `data_dir` is relative, it is resolved against the current working directory.
pub fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    if cfg.data_dir.starts_with('/') {
        PathBuf::from(&cfg.data_dir)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(&cfg.data_dir)
    }
}

/// Helpers for building in-memory buckets in tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::{Arc, InMemory, StorageKind, StorageManager};

    /// A fresh, empty in-memory bucket.
    pub fn memory_bucket(bucket: &str) -> StorageManager {
        StorageManager::with_backend(Arc::new(InMemory::new()), StorageKind::Memory, bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_basic_operations() {
        let storage = testing::memory_bucket("warehouse");
        assert_eq!(storage.bucket(), "warehouse");

        let location = "raw-site/2020-05-01/data/Covid1_data.json";
        storage
            .put(location, Bytes::from_static(b"{\"SubmittingCentre\":\"A\"}"))
            .await
            .expect("put");
        assert!(storage.exists(location).await.expect("exists"));

        let retrieved = storage.get(location).await.expect("get");
        assert_eq!(retrieved.as_ref(), b"{\"SubmittingCentre\":\"A\"}");

        assert!(!storage
            .exists("training/data/Covid1/data_2020-05-01.json")
            .await
            .expect("exists on missing key"));
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_the_first_object() {
        let storage = testing::memory_bucket("warehouse");
        let location = "training/xray-metadata/P1/S1/R1/x.json";

        assert!(storage
            .put_if_absent(location, Bytes::from_static(b"first"))
            .await
            .expect("create"));
        assert!(!storage
            .put_if_absent(location, Bytes::from_static(b"second"))
            .await
            .expect("second create"));

        let stored = storage.get(location).await.expect("get");
        assert_eq!(stored.as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_get_range_clamps_to_object_length() {
        let storage = testing::memory_bucket("warehouse");
        let content: Vec<u8> = (0..=255u8).collect();
        storage
            .put("images/a.dcm", Bytes::from(content.clone()))
            .await
            .expect("put");

        let head = storage.get_range("images/a.dcm", 0..16).await.expect("range");
        assert_eq!(head.as_ref(), content.get(..16).expect("slice"));

        let clamped = storage
            .get_range("images/a.dcm", 0..4096)
            .await
            .expect("clamped range");
        assert_eq!(clamped.len(), 256);
    }

    #[tokio::test]
    async fn test_copy_and_list() {
        let storage = testing::memory_bucket("warehouse");
        storage
            .put("raw-a/2020-01-01/images/x.dcm", Bytes::from_static(b"dicom"))
            .await
            .expect("put");

        storage
            .copy(
                "raw-a/2020-01-01/images/x.dcm",
                "training/xray/P1/S1/R1/x.dcm",
            )
            .await
            .expect("copy");

        let copied = storage.get("training/xray/P1/S1/R1/x.dcm").await.expect("get");
        assert_eq!(copied.as_ref(), b"dicom");

        let training = storage.list(Some("training")).await.expect("list");
        assert_eq!(training.len(), 1);
        let everything = storage.list(None).await.expect("list all");
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let storage = testing::memory_bucket("warehouse");
        let err = storage.get("config.json").await.expect_err("missing object");
        assert!(matches!(err, object_store::Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_local_backend_uses_bucket_subdirectory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig {
            storage: StorageKind::Local,
            data_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let storage = StorageManager::new(&cfg, "warehouse")
            .await
            .expect("local storage");
        assert_eq!(*storage.backend_kind(), StorageKind::Local);

        storage
            .put("training/data/P1/data_2020-01-01.json", Bytes::from_static(b"{}"))
            .await
            .expect("put");
        let on_disk = dir
            .path()
            .join("warehouse/training/data/P1/data_2020-01-01.json");
        assert!(on_disk.exists());
    }
}

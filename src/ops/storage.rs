//! Object storage for backup files.
//!
//! Backed by S3 when a bucket is configured, otherwise by a local directory.
//! Tests use the in-memory store.

use crate::config::BackupSettings;
use crate::error::{DbError, DbResult};
use crate::models::{BackupKind, BackupRecord};
use futures_util::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Stores and lists backups under the `full/` and `incremental/` prefixes.
#[derive(Debug, Clone)]
pub struct BackupStore {
    store: Arc<dyn ObjectStore>,
}

impl BackupStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// S3 when `bucket` is set, else a local store under `<path>/store`.
    pub fn from_settings(settings: &BackupSettings) -> DbResult<Self> {
        match &settings.bucket {
            Some(bucket) => Self::s3(bucket, &settings.region, settings.endpoint.as_deref()),
            None => Self::local(&settings.local_store_dir()),
        }
    }

    /// S3 bucket; credentials come from the standard AWS environment.
    pub fn s3(bucket: &str, region: &str, endpoint: Option<&str>) -> DbResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region);
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        info!(bucket = %bucket, region = %region, "Using S3 backup storage");
        Ok(Self::new(Arc::new(builder.build()?)))
    }

    pub fn local(dir: &Path) -> DbResult<Self> {
        std::fs::create_dir_all(dir)?;
        info!(dir = %dir.display(), "Using local backup storage");
        Ok(Self::new(Arc::new(LocalFileSystem::new_with_prefix(dir)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Upload a local file under `key`. Returns the uploaded size.
    pub async fn upload_file(&self, key: &str, file: &Path) -> DbResult<u64> {
        let data = tokio::fs::read(file).await.map_err(|e| {
            DbError::io(format!("Failed to read backup file {}: {}", file.display(), e))
        })?;
        let size = data.len() as u64;
        self.put(key, data).await?;
        info!(key = %key, size, "Uploaded backup");
        Ok(size)
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> DbResult<()> {
        let path = object_path(key)?;
        self.store.put(&path, PutPayload::from(data)).await?;
        Ok(())
    }

    /// Every backup under the known prefixes. Other keys are ignored.
    pub async fn list(&self) -> DbResult<Vec<BackupRecord>> {
        let mut records = Vec::new();
        for kind in BackupKind::ALL {
            let prefix = object_path(kind.prefix())?;
            let mut stream = self.store.list(Some(&prefix));
            while let Some(result) = stream.next().await {
                let meta = result?;
                let key = meta.location.to_string();
                if BackupKind::from_key(&key) != Some(kind) {
                    continue;
                }
                records.push(BackupRecord {
                    key,
                    kind,
                    last_modified: meta.last_modified,
                    size: meta.size as u64,
                });
            }
        }
        debug!(count = records.len(), "Listed backups");
        Ok(records)
    }

    pub async fn delete(&self, key: &str) -> DbResult<()> {
        let path = object_path(key)?;
        self.store.delete(&path).await?;
        Ok(())
    }
}

fn object_path(key: &str) -> DbResult<ObjectPath> {
    ObjectPath::parse(key)
        .map_err(|e| DbError::storage(format!("Invalid object key '{}': {}", key, e)))
}

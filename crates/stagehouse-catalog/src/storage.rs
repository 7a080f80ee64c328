//! Staging storage on top of `object_store`
//!
//! Three backends are supported:
//! - S3 (feature `aws`), the location warehouse COPY statements read from
//! - Local filesystem, for running against a warehouse that can read local paths
//! - In-memory, used by tests together with `MemoryWarehouse`

use crate::adapter::{CatalogError, ObjectStorage};
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use stagehouse_core::{StorageBackend, StorageConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Files at or above this size are uploaded in parts
const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Read size while streaming a file into a multipart upload
const CHUNK_SIZE: usize = 5 * 1024 * 1024;

fn storage_err(e: impl std::fmt::Display) -> CatalogError {
    CatalogError::Storage(e.to_string())
}

/// Object storage adapter addressed as `<scheme>://<bucket>/<key>`
#[derive(Clone)]
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    scheme: &'static str,
    bucket: String,
}

impl ObjectStoreStorage {
    /// Wrap an existing store
    pub fn new(store: Arc<dyn ObjectStore>, scheme: &'static str, bucket: impl Into<String>) -> Self {
        Self {
            store,
            scheme,
            bucket: bucket.into(),
        }
    }

    /// Process-local store; contents vanish with the value
    pub fn in_memory(bucket: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemory::new()), "memory", bucket)
    }

    /// Store rooted at a local directory, created if missing
    pub fn local(root: &Path) -> Result<Self, CatalogError> {
        std::fs::create_dir_all(root).map_err(storage_err)?;
        let store = object_store::local::LocalFileSystem::new_with_prefix(root).map_err(storage_err)?;
        let root = root.canonicalize().map_err(storage_err)?;
        Ok(Self::new(Arc::new(store), "file", root.display().to_string()))
    }

    /// S3 bucket, credentials taken from the standard AWS environment variables
    #[cfg(feature = "aws")]
    pub fn s3(bucket: &str, region: Option<&str>) -> Result<Self, CatalogError> {
        let mut builder = object_store::aws::AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        let store = builder.build().map_err(storage_err)?;
        Ok(Self::new(Arc::new(store), "s3", bucket))
    }

    /// S3 support not compiled
    #[cfg(not(feature = "aws"))]
    pub fn s3(_bucket: &str, _region: Option<&str>) -> Result<Self, CatalogError> {
        Err(CatalogError::Config(
            "S3 support not compiled. Rebuild with: cargo build --features aws".to_string(),
        ))
    }

    /// Build the backend selected in configuration
    pub fn from_config(config: &StorageConfig) -> Result<Self, CatalogError> {
        match config.backend {
            StorageBackend::S3 => Self::s3(&config.bucket, config.region.as_deref()),
            StorageBackend::Local => {
                let root = config.local_root.as_deref().ok_or_else(|| {
                    CatalogError::Config("storage.local_root is required for the local backend".to_string())
                })?;
                Self::local(root)
            }
            StorageBackend::Memory => Ok(Self::in_memory(config.bucket.clone())),
        }
    }

    /// Key addressed by `uri`, if it belongs to this store
    pub fn key_for_uri(&self, uri: &str) -> Option<String> {
        let prefix = format!("{}://{}/", self.scheme, self.bucket);
        uri.strip_prefix(&prefix).map(str::to_string)
    }

    /// Read an object back
    pub async fn get(&self, key: &str) -> Result<Bytes, CatalogError> {
        let path = ObjectPath::from(key);
        self.store
            .get(&path)
            .await
            .map_err(storage_err)?
            .bytes()
            .await
            .map_err(storage_err)
    }

    async fn upload_multipart(&self, local_path: &Path, path: &ObjectPath) -> Result<(), CatalogError> {
        let upload = self.store.put_multipart(path).await.map_err(storage_err)?;
        let mut writer = WriteMultipart::new(upload);
        let mut file = tokio::fs::File::open(local_path).await.map_err(storage_err)?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = file.read(&mut buf).await.map_err(storage_err)?;
            if n == 0 {
                break;
            }
            writer.wait_for_capacity(4).await.map_err(storage_err)?;
            writer.write(&buf[..n]);
        }

        writer.finish().await.map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStorage for ObjectStoreStorage {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, CatalogError> {
        let path = ObjectPath::from(key);
        let size = tokio::fs::metadata(local_path).await.map_err(storage_err)?.len();

        if size >= MULTIPART_THRESHOLD {
            self.upload_multipart(local_path, &path).await?;
        } else {
            let bytes = tokio::fs::read(local_path).await.map_err(storage_err)?;
            self.store
                .put(&path, PutPayload::from(Bytes::from(bytes)))
                .await
                .map_err(storage_err)?;
        }

        let uri = self.uri_for(key);
        debug!("Uploaded {} ({} bytes) to {}", local_path.display(), size, uri);
        Ok(uri)
    }

    async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<String, CatalogError> {
        let path = ObjectPath::from(key);
        self.store
            .put(&path, PutPayload::from(bytes))
            .await
            .map_err(storage_err)?;
        Ok(self.uri_for(key))
    }

    fn uri_for(&self, key: &str) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, key)
    }
}

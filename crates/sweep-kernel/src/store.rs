//! Object store capability used to remove bucket objects.

use std::{fs, sync::Arc};

use async_trait::async_trait;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path, ObjectStore,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Result of a successful removal call, echoed back to the event source.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RemovalInfo {
    pub bucket: String,
    pub removed: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object store configuration: {0}")]
    Configuration(String),
    #[error("bucket '{requested}' is not served by this client (configured '{configured}')")]
    UnknownBucket {
        requested: String,
        configured: String,
    },
    #[error("failed to remove '{key}': {source}")]
    Backend {
        key: String,
        #[source]
        source: object_store::Error,
    },
}

/// Removes named objects from a bucket.
///
/// Removing a key that is already absent must succeed so that redelivered
/// events stay harmless.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn remove(&self, bucket: &str, keys: &[String]) -> Result<RemovalInfo, StoreError>;
}

/// Connection settings for [`BucketStore::from_settings`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// `memory://`, `file:///path` or an `http(s)://` S3-compatible endpoint.
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: Option<String>,
    pub region: String,
}

/// [`ObjectStoreClient`] over a single bucket of an `object_store` backend.
#[derive(Debug, Clone)]
pub struct BucketStore {
    bucket: String,
    inner: Arc<dyn ObjectStore>,
}

impl BucketStore {
    pub fn new(bucket: impl Into<String>, inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.into(),
            inner,
        }
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self, StoreError> {
        let url = Url::parse(&settings.endpoint).map_err(|err| {
            StoreError::Configuration(format!(
                "invalid endpoint '{}': {err}",
                settings.endpoint
            ))
        })?;

        let inner: Arc<dyn ObjectStore> = match url.scheme() {
            "memory" => Arc::new(InMemory::new()),
            "file" => {
                let root = url.path();
                if root.is_empty() || root == "/" {
                    return Err(StoreError::Configuration(
                        "file endpoint must specify a path: file:///path/to/storage".into(),
                    ));
                }
                let bucket_root = std::path::Path::new(root).join(&settings.bucket);
                fs::create_dir_all(&bucket_root).map_err(|err| {
                    StoreError::Configuration(format!(
                        "creating {}: {err}",
                        bucket_root.display()
                    ))
                })?;
                let local = LocalFileSystem::new_with_prefix(&bucket_root).map_err(|err| {
                    StoreError::Configuration(format!("opening {}: {err}", bucket_root.display()))
                })?;
                Arc::new(local)
            }
            "http" | "https" => {
                let secret = settings
                    .secret_access_key
                    .as_deref()
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        StoreError::Configuration(
                            "an admin credential is required for S3 endpoints".into(),
                        )
                    })?;
                let s3 = AmazonS3Builder::new()
                    .with_endpoint(settings.endpoint.trim_end_matches('/'))
                    .with_bucket_name(&settings.bucket)
                    .with_region(&settings.region)
                    .with_access_key_id(&settings.access_key_id)
                    .with_secret_access_key(secret)
                    .with_allow_http(url.scheme() == "http")
                    .with_virtual_hosted_style_request(false)
                    .build()
                    .map_err(|err| StoreError::Configuration(err.to_string()))?;
                Arc::new(s3)
            }
            scheme => {
                return Err(StoreError::Configuration(format!(
                    "unsupported endpoint scheme '{scheme}' (supported: memory, file, http, https)"
                )))
            }
        };

        Ok(Self::new(settings.bucket.clone(), inner))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }
}

#[async_trait]
impl ObjectStoreClient for BucketStore {
    async fn remove(&self, bucket: &str, keys: &[String]) -> Result<RemovalInfo, StoreError> {
        if bucket != self.bucket {
            return Err(StoreError::UnknownBucket {
                requested: bucket.to_string(),
                configured: self.bucket.clone(),
            });
        }

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            let location = Path::from(key.as_str());
            match self.inner.delete(&location).await {
                Ok(()) => {}
                Err(object_store::Error::NotFound { .. }) => {
                    debug!(%key, "object already absent");
                }
                Err(source) => {
                    return Err(StoreError::Backend {
                        key: key.clone(),
                        source,
                    })
                }
            }
            removed.push(key.clone());
        }

        Ok(RemovalInfo {
            bucket: self.bucket.clone(),
            removed,
        })
    }
}

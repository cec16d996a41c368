//! Object store capability consumed by the bucket index.
//!
//! Everything above this module talks to a [`Bucket`]: a small, path-based
//! view over an object store that can list one directory level, fetch and
//! upload objects, delete them and look up their attributes. The
//! [`ObjectStoreBucket`] adapter backs it with any `object_store`
//! implementation, and [`TenantBucket`] scopes it to a single tenant.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Attributes of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// Object size in bytes.
    pub size: u64,
    /// Last time the object was written.
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("object store request for {path} failed: {source}")]
    Store {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BucketError {
    /// Classify an `object_store` error for the given path.
    pub fn from_store(path: impl Into<String>, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => BucketError::NotFound { path: path.into() },
            other => BucketError::Store {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BucketError::NotFound { .. })
    }
}

/// Path-based object store operations.
///
/// Names are `/`-separated and relative to the bucket root. Listings only
/// return the immediate children of a directory; sub-directories carry a
/// trailing `/`.
#[async_trait]
pub trait Bucket: Send + Sync + fmt::Debug {
    /// List the immediate children of `dir` (`""` is the root), sorted.
    async fn iter(&self, dir: &str) -> Result<Vec<String>, BucketError>;

    /// Fetch the full content of an object.
    async fn get(&self, name: &str) -> Result<Bytes, BucketError>;

    /// Look up the attributes of an object.
    async fn attributes(&self, name: &str) -> Result<ObjectAttributes, BucketError>;

    /// Create or overwrite an object.
    async fn upload(&self, name: &str, data: Bytes) -> Result<(), BucketError>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, name: &str) -> Result<(), BucketError>;

    async fn exists(&self, name: &str) -> Result<bool, BucketError> {
        match self.attributes(name).await {
            Ok(_) => Ok(true),
            Err(BucketError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// [`Bucket`] backed by an `object_store` implementation.
#[derive(Debug, Clone)]
pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn iter(&self, dir: &str) -> Result<Vec<String>, BucketError> {
        let dir = dir.trim_matches('/');
        let prefix = (!dir.is_empty()).then(|| ObjectPath::from(dir));

        let listing = self
            .store
            .list_with_delimiter(prefix.as_ref())
            .await
            .map_err(|e| BucketError::from_store(dir, e))?;

        let mut names: Vec<String> = listing
            .common_prefixes
            .iter()
            .map(|p| format!("{p}/"))
            .collect();
        names.extend(listing.objects.iter().map(|o| o.location.to_string()));
        names.sort();

        Ok(names)
    }

    async fn get(&self, name: &str) -> Result<Bytes, BucketError> {
        let path = ObjectPath::from(name);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| BucketError::from_store(name, e))?;

        result
            .bytes()
            .await
            .map_err(|e| BucketError::from_store(name, e))
    }

    async fn attributes(&self, name: &str) -> Result<ObjectAttributes, BucketError> {
        let meta = self
            .store
            .head(&ObjectPath::from(name))
            .await
            .map_err(|e| BucketError::from_store(name, e))?;

        Ok(ObjectAttributes {
            size: meta.size,
            last_modified: meta.last_modified,
        })
    }

    async fn upload(&self, name: &str, data: Bytes) -> Result<(), BucketError> {
        self.store
            .put(&ObjectPath::from(name), PutPayload::from(data))
            .await
            .map_err(|e| BucketError::from_store(name, e))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BucketError> {
        match self.store.delete(&ObjectPath::from(name)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(BucketError::from_store(name, e)),
        }
    }
}

/// A view of a bucket restricted to one tenant's directory.
///
/// Every name is resolved below `<tenant>/`, and listings are returned
/// relative to it.
#[derive(Debug, Clone)]
pub struct TenantBucket {
    inner: Arc<dyn Bucket>,
    tenant: String,
    prefix: String,
}

impl TenantBucket {
    pub fn new(inner: Arc<dyn Bucket>, tenant: impl Into<String>) -> Self {
        let tenant = tenant.into();
        let prefix = format!("{tenant}/");
        Self {
            inner,
            tenant,
            prefix,
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.trim_start_matches('/'))
    }
}

#[async_trait]
impl Bucket for TenantBucket {
    async fn iter(&self, dir: &str) -> Result<Vec<String>, BucketError> {
        let names = self.inner.iter(&self.full_name(dir)).await?;
        Ok(names
            .into_iter()
            .filter_map(|name| name.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Bytes, BucketError> {
        self.inner.get(&self.full_name(name)).await
    }

    async fn attributes(&self, name: &str) -> Result<ObjectAttributes, BucketError> {
        self.inner.attributes(&self.full_name(name)).await
    }

    async fn upload(&self, name: &str, data: Bytes) -> Result<(), BucketError> {
        self.inner.upload(&self.full_name(name), data).await
    }

    async fn delete(&self, name: &str) -> Result<(), BucketError> {
        self.inner.delete(&self.full_name(name)).await
    }
}

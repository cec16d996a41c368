//! Staged upload of externally built blocks.
//!
//! An upload starts by storing the sanitized metadata as `meta.json.temp`,
//! continues with the block files, and completes by promoting the temporary
//! metadata to `meta.json`. Until then the block has no `meta.json`, so the
//! index updater reports it as a partial block and readers never see it.

use bytes::Bytes;
use common::bucket::{Bucket, BucketError, TenantBucket};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::markers::{META_FILENAME, meta_path, temp_meta_path};
use crate::metadata::{
    BlockMeta, COMPACTOR_SHARD_ID_EXTERNAL_LABEL, DEPRECATED_SHARD_ID_EXTERNAL_LABEL,
    INGESTER_ID_EXTERNAL_LABEL, TENANT_ID_EXTERNAL_LABEL, decode_block_meta, encode_block_meta,
};

/// Source recorded in the metadata of uploaded blocks.
pub const UPLOAD_SOURCE: &str = "upload";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("block {0} already exists in object storage")]
    AlreadyExists(Ulid),

    #[error("upload of block {0} not started yet")]
    NotStarted(Ulid),

    #[error("{0}")]
    BadRequest(String),

    #[error("temporary metadata of block {block} is corrupted: {reason}")]
    CorruptedTempMeta { block: Ulid, reason: String },

    #[error(transparent)]
    Bucket(#[from] BucketError),

    #[error("failed to encode block metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Uploads blocks into one tenant's directory.
#[derive(Debug, Clone)]
pub struct BlockUploader {
    bucket: Arc<dyn Bucket>,
    tenant: String,
}

impl BlockUploader {
    pub fn new(root: Arc<dyn Bucket>, tenant: impl Into<String>) -> Self {
        let tenant = tenant.into();
        let bucket: Arc<dyn Bucket> = Arc::new(TenantBucket::new(root, tenant.clone()));
        Self { bucket, tenant }
    }

    /// Begin the upload of `block_id`, storing its sanitized metadata.
    ///
    /// The metadata is checked before anything is stored, so a rejected start
    /// leaves the block identifier free for another attempt.
    pub async fn start(
        &self,
        block_id: Ulid,
        meta: &BlockMeta,
    ) -> Result<BlockMeta, UploadError> {
        if !self.bucket.iter(&format!("{block_id}/")).await?.is_empty() {
            return Err(UploadError::AlreadyExists(block_id));
        }

        let meta = sanitize_meta(&self.tenant, block_id, meta)?;
        if let Err(e) = meta.validate() {
            return Err(UploadError::BadRequest(format!("invalid block metadata: {e}")));
        }

        self.bucket
            .upload(
                &temp_meta_path(block_id),
                Bytes::from(encode_block_meta(&meta)?),
            )
            .await?;

        info!(tenant = %self.tenant, block = %block_id, "Started block upload");
        Ok(meta)
    }

    /// Store one block file, e.g. `index` or `chunks/000001`.
    pub async fn upload_file(
        &self,
        block_id: Ulid,
        path: &str,
        data: Bytes,
    ) -> Result<(), UploadError> {
        validate_file_path(path)?;
        if data.is_empty() {
            return Err(UploadError::BadRequest("file cannot be empty".to_string()));
        }

        // The temporary metadata must exist and decode before any file lands.
        self.read_temp_meta(block_id).await?;

        let size = data.len();
        self.bucket
            .upload(&format!("{block_id}/{path}"), data)
            .await?;

        debug!(
            tenant = %self.tenant,
            block = %block_id,
            path,
            size,
            "Uploaded block file"
        );
        Ok(())
    }

    /// Promote the temporary metadata, making the block visible.
    pub async fn complete(&self, block_id: Ulid) -> Result<BlockMeta, UploadError> {
        let meta = self.read_temp_meta(block_id).await?;
        let meta = sanitize_meta(&self.tenant, block_id, &meta)?;

        self.bucket
            .upload(&meta_path(block_id), Bytes::from(encode_block_meta(&meta)?))
            .await?;
        self.bucket.delete(&temp_meta_path(block_id)).await?;

        info!(tenant = %self.tenant, block = %block_id, "Completed block upload");
        Ok(meta)
    }

    async fn read_temp_meta(&self, block_id: Ulid) -> Result<BlockMeta, UploadError> {
        let data = match self.bucket.get(&temp_meta_path(block_id)).await {
            Ok(data) => data,
            Err(BucketError::NotFound { .. }) => return Err(UploadError::NotStarted(block_id)),
            Err(e) => return Err(e.into()),
        };

        decode_block_meta(&data).map_err(|e| UploadError::CorruptedTempMeta {
            block: block_id,
            reason: e.to_string(),
        })
    }
}

/// Restrict the external labels of an uploaded block.
///
/// Returns a new metadata document owned by `tenant` with identifier
/// `block_id`; `meta` itself is left as is. The tenant and compactor shard
/// labels are kept, ingester and legacy shard labels are dropped, and any other
/// label rejects the upload.
pub fn sanitize_meta(
    tenant: &str,
    block_id: Ulid,
    meta: &BlockMeta,
) -> Result<BlockMeta, UploadError> {
    let mut labels = BTreeMap::new();
    let mut rejected = Vec::new();

    for (name, value) in &meta.thanos.labels {
        match name.as_str() {
            TENANT_ID_EXTERNAL_LABEL | COMPACTOR_SHARD_ID_EXTERNAL_LABEL => {
                labels.insert(name.clone(), value.clone());
            }
            INGESTER_ID_EXTERNAL_LABEL | DEPRECATED_SHARD_ID_EXTERNAL_LABEL => {
                debug!(
                    tenant,
                    block = %block_id,
                    label = %name,
                    value = %value,
                    "Removing unused external label"
                );
            }
            _ => rejected.push(name.as_str()),
        }
    }

    if !rejected.is_empty() {
        let rejected = rejected.join(",");
        warn!(
            tenant,
            block = %block_id,
            labels = %rejected,
            "Rejecting unsupported external labels"
        );
        return Err(UploadError::BadRequest(format!(
            "unsupported external label(s): {rejected}"
        )));
    }

    labels.insert(TENANT_ID_EXTERNAL_LABEL.to_string(), tenant.to_string());

    let mut sanitized = meta.clone();
    sanitized.ulid = block_id;
    sanitized.thanos.labels = labels;
    sanitized.thanos.source = UPLOAD_SOURCE.to_string();
    Ok(sanitized)
}

/// Accept `index` and `chunks/NNNNNN` only.
pub fn validate_file_path(path: &str) -> Result<(), UploadError> {
    if path.is_empty() {
        return Err(UploadError::BadRequest("missing file path".to_string()));
    }
    if path == META_FILENAME {
        return Err(UploadError::BadRequest("meta.json is not allowed".to_string()));
    }

    let valid = path == "index"
        || path
            .strip_prefix("chunks/")
            .is_some_and(|seq| seq.len() == 6 && seq.bytes().all(|b| b.is_ascii_digit()));
    if !valid {
        return Err(UploadError::BadRequest(format!("invalid path: {path:?}")));
    }

    Ok(())
}

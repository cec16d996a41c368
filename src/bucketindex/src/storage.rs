//! Persistence of the bucket index as gzipped JSON.

use bytes::Bytes;
use common::bucket::{Bucket, BucketError};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::debug;

use crate::index::Index;
use crate::markers::INDEX_FILENAME;

#[derive(Debug, Error)]
pub enum IndexStorageError {
    #[error("bucket index not found")]
    NotFound,

    #[error("bucket index corrupted: {0}")]
    Corrupted(String),

    #[error("failed to encode bucket index: {0}")]
    Encode(#[from] std::io::Error),

    #[error(transparent)]
    Bucket(BucketError),
}

impl From<BucketError> for IndexStorageError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::NotFound { .. } => IndexStorageError::NotFound,
            other => IndexStorageError::Bucket(other),
        }
    }
}

pub fn encode_index(index: &Index) -> Result<Vec<u8>, IndexStorageError> {
    let json = serde_json::to_vec(index).map_err(std::io::Error::from)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decode_index(data: &[u8]) -> Result<Index, IndexStorageError> {
    let mut json = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut json)
        .map_err(|e| IndexStorageError::Corrupted(e.to_string()))?;

    serde_json::from_slice(&json).map_err(|e| IndexStorageError::Corrupted(e.to_string()))
}

/// Upload the index of the tenant `bucket` is scoped to.
pub async fn write_index(bucket: &dyn Bucket, index: &Index) -> Result<(), IndexStorageError> {
    let data = encode_index(index)?;
    let size = data.len();

    bucket.upload(INDEX_FILENAME, Bytes::from(data)).await?;
    debug!(blocks = index.blocks.len(), size, "Wrote bucket index");
    Ok(())
}

pub async fn read_index(bucket: &dyn Bucket) -> Result<Index, IndexStorageError> {
    let data = bucket.get(INDEX_FILENAME).await?;
    decode_index(&data)
}

/// Remove the index. Succeeds when there is none.
pub async fn delete_index(bucket: &dyn Bucket) -> Result<(), IndexStorageError> {
    bucket.delete(INDEX_FILENAME).await?;
    Ok(())
}

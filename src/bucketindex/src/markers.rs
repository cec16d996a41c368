//! Object layout of a tenant's blocks and their lifecycle markers.
//!
//! Every block lives in `<block-id>/`. Markers are written twice: once next
//! to the block and once in the tenant-wide `markers/` directory, so that
//! readers can discover all marks with a single listing.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::bucket::{Bucket, BucketError};
use thiserror::Error;
use tracing::{debug, info};
use ulid::Ulid;

use crate::metadata::{DeletionMark, NoCompactMark, encode_deletion_mark, encode_no_compact_mark};
use crate::scan::parse_block_dir;

pub const META_FILENAME: &str = "meta.json";
pub const TEMP_META_FILENAME: &str = "meta.json.temp";
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";
pub const NO_COMPACT_MARK_FILENAME: &str = "no-compact-mark.json";

/// Tenant-wide directory mirroring every block marker.
pub const MARKERS_PREFIX: &str = "markers";

/// Name of the per-tenant bucket index object.
pub const INDEX_FILENAME: &str = "bucket-index.json.gz";

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error(transparent)]
    Bucket(#[from] BucketError),

    #[error("failed to encode marker: {0}")]
    Encode(#[from] serde_json::Error),
}

pub fn meta_path(id: Ulid) -> String {
    format!("{id}/{META_FILENAME}")
}

pub fn temp_meta_path(id: Ulid) -> String {
    format!("{id}/{TEMP_META_FILENAME}")
}

pub fn deletion_mark_path(id: Ulid) -> String {
    format!("{id}/{DELETION_MARK_FILENAME}")
}

pub fn no_compact_mark_path(id: Ulid) -> String {
    format!("{id}/{NO_COMPACT_MARK_FILENAME}")
}

pub fn global_deletion_mark_path(id: Ulid) -> String {
    format!("{MARKERS_PREFIX}/{id}-{DELETION_MARK_FILENAME}")
}

pub fn global_no_compact_mark_path(id: Ulid) -> String {
    format!("{MARKERS_PREFIX}/{id}-{NO_COMPACT_MARK_FILENAME}")
}

/// Block identifier of a global deletion marker, e.g.
/// `markers/01FSTQ95C8FS0ZAGTQS2EF1NEG-deletion-mark.json`.
pub fn parse_deletion_mark_filename(name: &str) -> Option<Ulid> {
    parse_global_marker(name, DELETION_MARK_FILENAME)
}

/// Block identifier of a global no-compact marker.
pub fn parse_no_compact_mark_filename(name: &str) -> Option<Ulid> {
    parse_global_marker(name, NO_COMPACT_MARK_FILENAME)
}

fn parse_global_marker(name: &str, suffix: &str) -> Option<Ulid> {
    let base = name.rsplit('/').next()?;
    let id = base.strip_suffix(suffix)?.strip_suffix('-')?;
    Ulid::from_string(id).ok()
}

/// Mark a block for deletion, both next to the block and globally.
pub async fn upload_deletion_mark(
    bucket: &dyn Bucket,
    id: Ulid,
    details: &str,
    deletion_time: DateTime<Utc>,
) -> Result<DeletionMark, MarkerError> {
    let mut mark = DeletionMark::new(id, deletion_time);
    mark.details = details.to_string();

    let data = Bytes::from(encode_deletion_mark(&mark)?);
    bucket.upload(&deletion_mark_path(id), data.clone()).await?;
    bucket.upload(&global_deletion_mark_path(id), data).await?;

    debug!(block = %id, "Uploaded deletion mark");
    Ok(mark)
}

/// Exclude a block from compaction, both next to the block and globally.
pub async fn upload_no_compact_mark(
    bucket: &dyn Bucket,
    id: Ulid,
    reason: &str,
    details: &str,
    marked_at: DateTime<Utc>,
) -> Result<NoCompactMark, MarkerError> {
    let mut mark = NoCompactMark::new(id, reason, marked_at);
    mark.details = details.to_string();

    let data = Bytes::from(encode_no_compact_mark(&mark)?);
    bucket.upload(&no_compact_mark_path(id), data.clone()).await?;
    bucket.upload(&global_no_compact_mark_path(id), data).await?;

    debug!(block = %id, "Uploaded no-compact mark");
    Ok(mark)
}

/// Hard-delete a block.
///
/// `meta.json` goes first so an interrupted deletion leaves a partial block
/// rather than a block that looks complete. The deletion mark goes last so the
/// deletion can be resumed, and the global markers follow it.
pub async fn delete_block(bucket: &dyn Bucket, id: Ulid) -> Result<(), MarkerError> {
    bucket.delete(&meta_path(id)).await?;

    let deletion_mark = deletion_mark_path(id);
    let mut files = list_recursive(bucket, &format!("{id}/")).await?;
    files.retain(|name| name != &deletion_mark);
    for name in &files {
        bucket.delete(name).await?;
    }

    bucket.delete(&deletion_mark).await?;
    bucket.delete(&global_deletion_mark_path(id)).await?;
    bucket.delete(&global_no_compact_mark_path(id)).await?;

    info!(block = %id, files = files.len() + 1, "Deleted block");
    Ok(())
}

/// Mirror per-block deletion marks that have no global copy into `markers/`.
///
/// Returns the identifiers of the blocks whose mark was copied.
pub async fn migrate_deletion_marks_to_global(
    bucket: &dyn Bucket,
) -> Result<Vec<Ulid>, MarkerError> {
    let mut migrated = Vec::new();

    for entry in bucket.iter("").await? {
        let Some(id) = parse_block_dir(&entry) else {
            continue;
        };

        let data = match bucket.get(&deletion_mark_path(id)).await {
            Ok(data) => data,
            Err(BucketError::NotFound { .. }) => continue,
            Err(e) => return Err(e.into()),
        };

        let global = global_deletion_mark_path(id);
        if bucket.exists(&global).await? {
            continue;
        }
        bucket.upload(&global, data).await?;
        migrated.push(id);
    }

    if !migrated.is_empty() {
        info!(count = migrated.len(), "Migrated deletion marks to global location");
    }
    Ok(migrated)
}

async fn list_recursive(bucket: &dyn Bucket, dir: &str) -> Result<Vec<String>, BucketError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_string()];

    while let Some(dir) = pending.pop() {
        for name in bucket.iter(&dir).await? {
            if name.ends_with('/') {
                pending.push(name);
            } else {
                files.push(name);
            }
        }
    }

    Ok(files)
}

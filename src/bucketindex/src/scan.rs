//! Listing of a tenant's block directories and global markers.

use common::bucket::{Bucket, BucketError};
use std::collections::BTreeSet;
use ulid::Ulid;

use crate::markers::{MARKERS_PREFIX, parse_deletion_mark_filename, parse_no_compact_mark_filename};

/// What a single listing pass observed in a tenant's bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub blocks: BTreeSet<Ulid>,
    pub deletion_marks: BTreeSet<Ulid>,
    /// Recognised so they are not mistaken for stray objects; never indexed.
    pub no_compact_marks: BTreeSet<Ulid>,
}

/// List block directories and global markers concurrently.
pub async fn scan(bucket: &dyn Bucket) -> Result<ScanResult, BucketError> {
    let (blocks, (deletion_marks, no_compact_marks)) =
        tokio::try_join!(scan_blocks(bucket), scan_markers(bucket))?;

    Ok(ScanResult {
        blocks,
        deletion_marks,
        no_compact_marks,
    })
}

/// Identifiers of every top-level directory named after a block.
pub async fn scan_blocks(bucket: &dyn Bucket) -> Result<BTreeSet<Ulid>, BucketError> {
    let entries = bucket.iter("").await?;
    Ok(entries.iter().filter_map(|e| parse_block_dir(e)).collect())
}

/// Block identifiers of the deletion and no-compact marks under `markers/`.
pub async fn scan_markers(
    bucket: &dyn Bucket,
) -> Result<(BTreeSet<Ulid>, BTreeSet<Ulid>), BucketError> {
    let mut deletion_marks = BTreeSet::new();
    let mut no_compact_marks = BTreeSet::new();

    for name in bucket.iter(MARKERS_PREFIX).await? {
        if let Some(id) = parse_deletion_mark_filename(&name) {
            deletion_marks.insert(id);
        } else if let Some(id) = parse_no_compact_mark_filename(&name) {
            no_compact_marks.insert(id);
        }
    }

    Ok((deletion_marks, no_compact_marks))
}

/// Block identifier of a directory entry such as `01FSTQ95C8FS0ZAGTQS2EF1NEG/`.
pub fn parse_block_dir(entry: &str) -> Option<Ulid> {
    let dir = entry.strip_suffix('/')?;
    Ulid::from_string(dir).ok()
}

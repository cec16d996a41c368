//! Reconciliation of a tenant's bucket index against the object store.
//!
//! One call to [`Updater::update_index`] lists the tenant's blocks and global
//! deletion marks, reuses every block entry of the previous index that is
//! still listed, fetches `meta.json` only for the blocks it has never seen,
//! and fetches every listed deletion mark. Blocks that cannot be indexed are
//! reported back as partial blocks instead of failing the pass.

use chrono::Utc;
use common::bucket::{Bucket, BucketError, TenantBucket};
use common::config::BucketIndexConfig;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::index::{Block, BlockDeletionMark, INDEX_VERSION_CURRENT, Index};
use crate::markers::{deletion_mark_path, meta_path};
use crate::metadata::{decode_block_meta, decode_deletion_mark};
use crate::metrics::UpdaterMetrics;
use crate::scan::scan;

/// Why a listed block could not be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockMetaError {
    #[error("block meta.json not found")]
    NotFound,

    #[error("block meta.json corrupted: {0}")]
    Corrupted(String),

    /// The store failed while fetching the block's metadata.
    #[error("block meta.json unavailable: {0}")]
    Unavailable(String),
}

impl From<BucketError> for BlockMetaError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::NotFound { .. } => BlockMetaError::NotFound,
            other => BlockMetaError::Unavailable(other.to_string()),
        }
    }
}

/// Why a listed deletion mark was left out of the index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeletionMarkError {
    #[error("deletion mark not found")]
    NotFound,

    #[error("deletion mark corrupted: {0}")]
    Corrupted(String),

    #[error("deletion mark unavailable: {0}")]
    Unavailable(String),
}

impl From<BucketError> for DeletionMarkError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::NotFound { .. } => DeletionMarkError::NotFound,
            other => DeletionMarkError::Unavailable(other.to_string()),
        }
    }
}

/// Blocks seen in the listing but missing from the new index.
pub type PartialBlocks = HashMap<Ulid, BlockMetaError>;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("failed to list blocks of tenant {tenant}: {source}")]
    ListingFailed {
        tenant: String,
        #[source]
        source: BucketError,
    },

    #[error("bucket index update of tenant {tenant} cancelled")]
    Cancelled { tenant: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// Maximum number of meta.json fetches in flight.
    pub meta_fetch_concurrency: usize,
    /// Maximum number of deletion mark fetches in flight.
    pub mark_fetch_concurrency: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            meta_fetch_concurrency: 20,
            mark_fetch_concurrency: 10,
        }
    }
}

impl From<&BucketIndexConfig> for UpdaterConfig {
    fn from(config: &BucketIndexConfig) -> Self {
        Self {
            meta_fetch_concurrency: config.meta_sync_concurrency,
            mark_fetch_concurrency: config.mark_sync_concurrency,
        }
    }
}

/// Builds and refreshes the bucket index of one tenant.
#[derive(Debug, Clone)]
pub struct Updater {
    bucket: Arc<dyn Bucket>,
    tenant: String,
    config: UpdaterConfig,
    metrics: UpdaterMetrics,
}

#[derive(Debug, Default)]
struct BlockUpdate {
    blocks: Vec<Block>,
    partials: PartialBlocks,
    reused: usize,
    fetched: usize,
}

impl Updater {
    /// Create an updater for `tenant`, whose blocks live under `<tenant>/` in
    /// the root bucket.
    pub fn new(
        root: Arc<dyn Bucket>,
        tenant: impl Into<String>,
        config: UpdaterConfig,
        metrics: UpdaterMetrics,
    ) -> Self {
        let tenant = tenant.into();
        let bucket: Arc<dyn Bucket> = Arc::new(TenantBucket::new(root, tenant.clone()));
        Self {
            bucket,
            tenant,
            config,
            metrics,
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The tenant-scoped bucket the updater reads from.
    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    /// Run one reconciliation pass.
    ///
    /// `old` is never modified. The returned index always carries
    /// [`INDEX_VERSION_CURRENT`]; block entries of `old` are only reused when
    /// it has that same version.
    pub async fn update_index(
        &self,
        old: Option<&Index>,
        cancel: &CancellationToken,
    ) -> Result<(Index, PartialBlocks), UpdaterError> {
        self.metrics.record_update_start();
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpdaterError::Cancelled {
                tenant: self.tenant.clone(),
            }),
            result = self.reconcile(old) => result,
        };

        match result {
            Ok((index, update)) => {
                let elapsed = start.elapsed();
                self.metrics.record_update_success(
                    update.reused,
                    update.fetched,
                    update.partials.len(),
                    elapsed,
                );
                info!(
                    tenant = %self.tenant,
                    blocks = index.blocks.len(),
                    deletion_marks = index.block_deletion_marks.len(),
                    reused = update.reused,
                    fetched = update.fetched,
                    partials = update.partials.len(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Updated bucket index"
                );
                Ok((index, update.partials))
            }
            Err(err) => {
                match &err {
                    UpdaterError::Cancelled { .. } => self.metrics.record_update_cancelled(),
                    UpdaterError::ListingFailed { .. } => self.metrics.record_update_failure(),
                }
                warn!(tenant = %self.tenant, error = %err, "Bucket index update failed");
                Err(err)
            }
        }
    }

    async fn reconcile(&self, old: Option<&Index>) -> Result<(Index, BlockUpdate), UpdaterError> {
        let scanned = scan(self.bucket.as_ref())
            .await
            .map_err(|source| UpdaterError::ListingFailed {
                tenant: self.tenant.clone(),
                source,
            })?;

        debug!(
            tenant = %self.tenant,
            blocks = scanned.blocks.len(),
            deletion_marks = scanned.deletion_marks.len(),
            no_compact_marks = scanned.no_compact_marks.len(),
            "Listed tenant bucket"
        );

        let (mut update, block_deletion_marks) = tokio::join!(
            self.update_blocks(old, &scanned.blocks),
            self.update_deletion_marks(&scanned.deletion_marks),
        );

        let index = Index {
            version: INDEX_VERSION_CURRENT,
            blocks: std::mem::take(&mut update.blocks),
            block_deletion_marks,
            updated_at: Utc::now().timestamp(),
        };

        Ok((index, update))
    }

    async fn update_blocks(&self, old: Option<&Index>, discovered: &BTreeSet<Ulid>) -> BlockUpdate {
        let cached: HashMap<Ulid, &Block> = match old {
            Some(old) if old.version == INDEX_VERSION_CURRENT => {
                old.blocks.iter().map(|b| (b.id, b)).collect()
            }
            Some(old) => {
                info!(
                    tenant = %self.tenant,
                    old_version = old.version,
                    version = INDEX_VERSION_CURRENT,
                    "Bucket index version changed, fetching all block metadata"
                );
                HashMap::new()
            }
            None => HashMap::new(),
        };

        let mut update = BlockUpdate::default();
        let mut to_fetch = Vec::new();

        for id in discovered {
            match cached.get(id) {
                Some(block) => {
                    update.blocks.push((*block).clone());
                    update.reused += 1;
                }
                None => to_fetch.push(*id),
            }
        }

        let fetched: Vec<(Ulid, Result<Block, BlockMetaError>)> = stream::iter(to_fetch)
            .map(|id| async move { (id, self.fetch_block(id).await) })
            .buffer_unordered(self.config.meta_fetch_concurrency.max(1))
            .collect()
            .await;

        for (id, result) in fetched {
            match result {
                Ok(block) => {
                    debug!(tenant = %self.tenant, block = %block, "Indexed new block");
                    update.blocks.push(block);
                    update.fetched += 1;
                }
                Err(err) => {
                    update.partials.insert(id, err);
                }
            }
        }

        update.blocks.sort_by_key(|b| b.id);
        update
    }

    async fn fetch_block(&self, id: Ulid) -> Result<Block, BlockMetaError> {
        let path = meta_path(id);

        let data = self.bucket.get(&path).await?;
        let meta = decode_block_meta(&data).map_err(|e| BlockMetaError::Corrupted(e.to_string()))?;
        if meta.ulid != id {
            return Err(BlockMetaError::Corrupted(format!(
                "meta.json describes block {}",
                meta.ulid
            )));
        }

        let attrs = self.bucket.attributes(&path).await?;
        Ok(Block::from_meta(&meta, attrs.last_modified))
    }

    async fn update_deletion_marks(&self, discovered: &BTreeSet<Ulid>) -> Vec<BlockDeletionMark> {
        let fetched: Vec<(Ulid, Result<BlockDeletionMark, DeletionMarkError>)> =
            stream::iter(discovered.iter().copied())
                .map(|id| async move { (id, self.fetch_deletion_mark(id).await) })
                .buffer_unordered(self.config.mark_fetch_concurrency.max(1))
                .collect()
                .await;

        let mut marks = Vec::with_capacity(fetched.len());
        let mut dropped = 0;

        for (id, result) in fetched {
            match result {
                Ok(mark) => marks.push(mark),
                Err(DeletionMarkError::NotFound) => {
                    dropped += 1;
                    debug!(tenant = %self.tenant, block = %id, "Deletion mark vanished, skipping");
                }
                Err(err) => {
                    dropped += 1;
                    warn!(
                        tenant = %self.tenant,
                        block = %id,
                        error = %err,
                        "Skipping unreadable deletion mark"
                    );
                }
            }
        }

        self.metrics.record_deletion_marks(marks.len(), dropped);
        marks.sort_by_key(|m| m.id);
        marks
    }

    async fn fetch_deletion_mark(&self, id: Ulid) -> Result<BlockDeletionMark, DeletionMarkError> {
        let data = self.bucket.get(&deletion_mark_path(id)).await?;
        let mark =
            decode_deletion_mark(&data).map_err(|e| DeletionMarkError::Corrupted(e.to_string()))?;
        if mark.id != id {
            return Err(DeletionMarkError::Corrupted(format!(
                "deletion mark describes block {}",
                mark.id
            )));
        }

        Ok(BlockDeletionMark::from_mark(&mark))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::INDEX_VERSION_1;
    use crate::metadata::{BlockMeta, encode_block_meta};
    use crate::testutil::{CountingBucket, memory_bucket, mock_deletion_mark, mock_storage_block};
    use bytes::Bytes;
    use std::time::Duration;

    fn updater(root: Arc<dyn Bucket>, tenant: &str) -> Updater {
        Updater::new(root, tenant, UpdaterConfig::default(), UpdaterMetrics::new())
    }

    #[tokio::test]
    async fn test_meta_for_another_block_is_corrupted() {
        let root = memory_bucket();
        let healthy = mock_storage_block(&root, "user-1", 10, 20, &[]).await;

        let misplaced = Ulid::new();
        let meta = BlockMeta::new(Ulid::new(), 20, 30);
        root.upload(
            &format!("user-1/{misplaced}/meta.json"),
            Bytes::from(encode_block_meta(&meta).unwrap()),
        )
        .await
        .unwrap();

        let (index, partials) = updater(root, "user-1")
            .update_index(None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(index.block_ids(), BTreeSet::from([healthy.ulid]));
        assert!(matches!(partials.get(&misplaced), Some(BlockMetaError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_partial_block() {
        let inner = memory_bucket();
        let healthy = mock_storage_block(&inner, "user-1", 10, 20, &[]).await;
        let flaky = mock_storage_block(&inner, "user-1", 20, 30, &[]).await;

        let bucket = Arc::new(CountingBucket::new(inner));
        bucket.fail_get(&format!("user-1/{}/meta.json", flaky.ulid));

        let metrics = UpdaterMetrics::new();
        let updater = Updater::new(
            bucket.clone(),
            "user-1",
            UpdaterConfig::default(),
            metrics.clone(),
        );
        let (index, partials) = updater
            .update_index(None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(index.block_ids(), BTreeSet::from([healthy.ulid]));
        assert_eq!(partials.len(), 1);
        assert!(matches!(partials.get(&flaky.ulid), Some(BlockMetaError::Unavailable(_))));
        assert_eq!(metrics.updates_succeeded(), 1);
        assert_eq!(metrics.partial_blocks(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_deletion_mark_is_dropped() {
        let inner = memory_bucket();
        let block = mock_storage_block(&inner, "user-1", 10, 20, &[]).await;
        mock_deletion_mark(&inner, "user-1", block.ulid).await;

        let bucket = Arc::new(CountingBucket::new(inner));
        bucket.fail_get(&format!("user-1/{}/deletion-mark.json", block.ulid));

        let metrics = UpdaterMetrics::new();
        let updater = Updater::new(bucket, "user-1", UpdaterConfig::default(), metrics.clone());
        let (index, partials) = updater
            .update_index(None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(index.block_ids(), BTreeSet::from([block.ulid]));
        assert!(index.block_deletion_marks.is_empty());
        assert!(partials.is_empty());
        assert_eq!(metrics.deletion_marks_dropped(), 1);
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let inner = memory_bucket();
        mock_storage_block(&inner, "user-1", 10, 20, &[]).await;

        let bucket = Arc::new(CountingBucket::new(inner));
        bucket.fail_iter(true);

        let metrics = UpdaterMetrics::new();
        let updater = Updater::new(bucket, "user-1", UpdaterConfig::default(), metrics.clone());
        let err = updater
            .update_index(None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(
            matches!(err, UpdaterError::ListingFailed { ref tenant, .. } if tenant == "user-1"),
            "{err}"
        );
        assert_eq!(metrics.updates_failed(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_pass_returns_no_index() {
        let inner = memory_bucket();
        mock_storage_block(&inner, "user-1", 10, 20, &[]).await;

        let bucket = Arc::new(CountingBucket::new(inner));
        bucket.set_get_delay(Duration::from_secs(60));

        let metrics = UpdaterMetrics::new();
        let updater = Updater::new(bucket, "user-1", UpdaterConfig::default(), metrics.clone());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), updater.update_index(None, &cancel))
            .await
            .expect("cancellation must be observed promptly")
            .unwrap_err();

        assert!(matches!(err, UpdaterError::Cancelled { .. }));
        assert_eq!(metrics.updates_cancelled(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_pass_does_not_touch_store() {
        let inner = memory_bucket();
        mock_storage_block(&inner, "user-1", 10, 20, &[]).await;
        let bucket = Arc::new(CountingBucket::new(inner));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = updater(bucket.clone(), "user-1")
            .update_index(None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::Cancelled { .. }));
        assert_eq!(bucket.total_gets(), 0);
    }

    #[tokio::test]
    async fn test_unknown_index_version_forces_refetch() {
        let inner = memory_bucket();
        let block = mock_storage_block(&inner, "user-1", 10, 20, &[]).await;
        let bucket = Arc::new(CountingBucket::new(inner));
        let updater = updater(bucket.clone(), "user-1");
        let cancel = CancellationToken::new();

        let (mut old, _) = updater.update_index(None, &cancel).await.unwrap();
        let meta_path = format!("user-1/{}/meta.json", block.ulid);
        assert_eq!(bucket.get_count(&meta_path), 1);

        for version in [INDEX_VERSION_1, INDEX_VERSION_CURRENT + 1] {
            old.version = version;
            let (index, _) = updater.update_index(Some(&old), &cancel).await.unwrap();
            assert_eq!(index.version, INDEX_VERSION_CURRENT);
        }
        assert_eq!(bucket.get_count(&meta_path), 3);

        old.version = INDEX_VERSION_CURRENT;
        updater.update_index(Some(&old), &cancel).await.unwrap();
        assert_eq!(bucket.get_count(&meta_path), 3);
    }

    #[tokio::test]
    async fn test_concurrency_limits_are_clamped() {
        let root = memory_bucket();
        let block = mock_storage_block(&root, "user-1", 10, 20, &[]).await;
        mock_deletion_mark(&root, "user-1", block.ulid).await;

        let config = UpdaterConfig {
            meta_fetch_concurrency: 0,
            mark_fetch_concurrency: 0,
        };
        let updater = Updater::new(root, "user-1", config, UpdaterMetrics::new());
        let (index, _) = updater
            .update_index(None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(index.blocks.len(), 1);
        assert_eq!(index.block_deletion_marks.len(), 1);
    }

    #[test]
    fn test_config_from_bucket_index_config() {
        let config = BucketIndexConfig {
            meta_sync_concurrency: 5,
            mark_sync_concurrency: 3,
            ..Default::default()
        };

        assert_eq!(
            UpdaterConfig::from(&config),
            UpdaterConfig {
                meta_fetch_concurrency: 5,
                mark_fetch_concurrency: 3,
            }
        );
    }
}

//! Per-tenant bucket index of a block-based, object-store-backed TSDB.
//!
//! The [`Updater`] reconciles a tenant's previous [`Index`] against the blocks
//! and deletion marks currently in the bucket; [`sync::update_tenant_index`]
//! wraps one pass with reading and writing the persisted index.

pub mod index;
pub mod markers;
pub mod metadata;
pub mod metrics;
pub mod scan;
pub mod storage;
pub mod sync;
pub mod updater;
pub mod upload;

#[cfg(any(test, feature = "testing"))]
pub mod testutil;

pub use index::{
    Block, BlockDeletionMark, INDEX_VERSION_1, INDEX_VERSION_2, INDEX_VERSION_CURRENT, Index,
};
pub use metrics::{MetricsSummary, UpdaterMetrics};
pub use storage::{IndexStorageError, delete_index, read_index, write_index};
pub use sync::{SyncError, SyncReport, list_tenants, update_tenant_index};
pub use updater::{BlockMetaError, PartialBlocks, Updater, UpdaterConfig, UpdaterError};
pub use upload::{BlockUploader, UploadError};

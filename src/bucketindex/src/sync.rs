//! One full read-update-write cycle of a tenant's bucket index.

use common::bucket::{Bucket, BucketError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::index::Index;
use crate::metrics::UpdaterMetrics;
use crate::storage::{IndexStorageError, read_index, write_index};
use crate::updater::{PartialBlocks, Updater, UpdaterConfig, UpdaterError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Update(#[from] UpdaterError),

    #[error("failed to read bucket index of tenant {tenant}: {source}")]
    ReadIndex {
        tenant: String,
        #[source]
        source: IndexStorageError,
    },

    #[error("failed to write bucket index of tenant {tenant}: {source}")]
    WriteIndex {
        tenant: String,
        #[source]
        source: IndexStorageError,
    },

    #[error("bucket index sync of tenant {tenant} cancelled")]
    Cancelled { tenant: String },
}

/// Outcome of [`update_tenant_index`].
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub tenant: String,
    pub index: Index,
    pub partials: PartialBlocks,
    /// The previous index was missing or unreadable.
    pub rebuilt: bool,
}

/// Read the tenant's current index, reconcile it and write the result.
///
/// A missing or corrupted index is rebuilt from scratch. Every step races
/// `cancel`, and a cancelled sync returns without replacing the stored index.
pub async fn update_tenant_index(
    root: Arc<dyn Bucket>,
    tenant: &str,
    config: &UpdaterConfig,
    metrics: &UpdaterMetrics,
    cancel: &CancellationToken,
) -> Result<SyncReport, SyncError> {
    let updater = Updater::new(root, tenant, *config, metrics.clone());
    let cancelled = || {
        metrics.record_update_cancelled();
        SyncError::Cancelled {
            tenant: tenant.to_string(),
        }
    };

    let read = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(cancelled()),
        result = read_index(updater.bucket().as_ref()) => result,
    };
    let old = match read {
        Ok(index) => Some(index),
        Err(IndexStorageError::NotFound) => None,
        Err(IndexStorageError::Corrupted(reason)) => {
            warn!(tenant, reason, "Bucket index corrupted, rebuilding it");
            None
        }
        Err(source) => {
            return Err(SyncError::ReadIndex {
                tenant: tenant.to_string(),
                source,
            });
        }
    };
    let rebuilt = old.is_none();

    let (index, partials) = updater.update_index(old.as_ref(), cancel).await?;

    for (id, err) in &partials {
        warn!(tenant, block = %id, error = %err, "Block not included in bucket index");
    }

    let written = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(cancelled()),
        result = write_index(updater.bucket().as_ref(), &index) => result,
    };
    written.map_err(|source| SyncError::WriteIndex {
        tenant: tenant.to_string(),
        source,
    })?;

    info!(
        tenant,
        blocks = index.blocks.len(),
        partials = partials.len(),
        rebuilt,
        "Wrote bucket index"
    );

    Ok(SyncReport {
        tenant: tenant.to_string(),
        index,
        partials,
        rebuilt,
    })
}

/// Tenants with a directory at the bucket root, sorted.
pub async fn list_tenants(root: &dyn Bucket) -> Result<Vec<String>, BucketError> {
    let entries = root.iter("").await?;

    Ok(entries
        .iter()
        .filter_map(|e| e.strip_suffix('/'))
        .map(str::to_string)
        .collect())
}

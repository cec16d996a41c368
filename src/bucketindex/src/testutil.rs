//! Helpers to populate buckets and observe how they are accessed in tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use common::bucket::{Bucket, BucketError, ObjectAttributes, ObjectStoreBucket, TenantBucket};
use object_store::memory::InMemory;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ulid::Ulid;

use crate::markers::{meta_path, upload_deletion_mark, upload_no_compact_mark};
use crate::metadata::{BlockMeta, DeletionMark, NoCompactMark, encode_block_meta};

/// An empty bucket backed by `object_store`'s in-memory store.
pub fn memory_bucket() -> Arc<dyn Bucket> {
    Arc::new(ObjectStoreBucket::new(Arc::new(InMemory::new())))
}

/// Store a complete block for `tenant` and return its metadata.
///
/// Panics if the bucket rejects an upload.
pub async fn mock_storage_block(
    root: &Arc<dyn Bucket>,
    tenant: &str,
    min_time: i64,
    max_time: i64,
    labels: &[(&str, &str)],
) -> BlockMeta {
    let meta = BlockMeta::new(Ulid::new(), min_time, max_time).with_labels(labels.iter().copied());
    let id = meta.ulid;
    let bucket = TenantBucket::new(root.clone(), tenant);

    let encoded = encode_block_meta(&meta).unwrap_or_else(|e| panic!("encode meta.json: {e}"));
    for (name, data) in [
        (format!("{id}/index"), Bytes::from_static(b"index")),
        (format!("{id}/chunks/000001"), Bytes::from_static(b"chunks")),
        (meta_path(id), Bytes::from(encoded)),
    ] {
        bucket
            .upload(&name, data)
            .await
            .unwrap_or_else(|e| panic!("upload {name}: {e}"));
    }

    meta
}

/// Mark a block of `tenant` for deletion now.
pub async fn mock_deletion_mark(root: &Arc<dyn Bucket>, tenant: &str, id: Ulid) -> DeletionMark {
    let bucket = TenantBucket::new(root.clone(), tenant);
    upload_deletion_mark(&bucket, id, "", Utc::now())
        .await
        .unwrap_or_else(|e| panic!("upload deletion mark: {e}"))
}

pub async fn mock_no_compact_mark(root: &Arc<dyn Bucket>, tenant: &str, id: Ulid) -> NoCompactMark {
    let bucket = TenantBucket::new(root.clone(), tenant);
    upload_no_compact_mark(&bucket, id, "manual", "", Utc::now())
        .await
        .unwrap_or_else(|e| panic!("upload no-compact mark: {e}"))
}

/// Unix timestamp (seconds) the index is expected to record for a block.
pub async fn block_uploaded_at(root: &Arc<dyn Bucket>, tenant: &str, id: Ulid) -> i64 {
    root.attributes(&format!("{tenant}/{}", meta_path(id)))
        .await
        .unwrap_or_else(|e| panic!("attributes of {id} meta.json: {e}"))
        .last_modified
        .timestamp()
}

/// Bucket wrapper counting reads and injecting failures or latency.
///
/// Paths are the full paths seen by the wrapped bucket.
#[derive(Debug)]
pub struct CountingBucket {
    inner: Arc<dyn Bucket>,
    gets: Mutex<HashMap<String, usize>>,
    failing_gets: Mutex<HashSet<String>>,
    fail_iter: AtomicBool,
    get_delay: Mutex<Option<Duration>>,
}

impl CountingBucket {
    pub fn new(inner: Arc<dyn Bucket>) -> Self {
        Self {
            inner,
            gets: Mutex::default(),
            failing_gets: Mutex::default(),
            fail_iter: AtomicBool::new(false),
            get_delay: Mutex::default(),
        }
    }

    pub fn get_count(&self, name: &str) -> usize {
        lock(&self.gets).get(name).copied().unwrap_or_default()
    }

    pub fn total_gets(&self) -> usize {
        lock(&self.gets).values().sum()
    }

    /// Number of reads of objects whose name ends with `suffix`.
    pub fn gets_matching(&self, suffix: &str) -> usize {
        lock(&self.gets)
            .iter()
            .filter(|(name, _)| name.ends_with(suffix))
            .map(|(_, count)| count)
            .sum()
    }

    pub fn reset_counts(&self) {
        lock(&self.gets).clear();
    }

    /// Make every read of `name` fail with a transport error.
    pub fn fail_get(&self, name: &str) {
        lock(&self.failing_gets).insert(name.to_string());
    }

    /// Make every listing fail with a transport error.
    pub fn fail_iter(&self, fail: bool) {
        self.fail_iter.store(fail, Ordering::SeqCst);
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *lock(&self.get_delay) = Some(delay);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected_failure(path: &str) -> BucketError {
    BucketError::Store {
        path: path.to_string(),
        source: Box::new(std::io::Error::other("injected failure")),
    }
}

#[async_trait]
impl Bucket for CountingBucket {
    async fn iter(&self, dir: &str) -> Result<Vec<String>, BucketError> {
        if self.fail_iter.load(Ordering::SeqCst) {
            return Err(injected_failure(dir));
        }
        self.inner.iter(dir).await
    }

    async fn get(&self, name: &str) -> Result<Bytes, BucketError> {
        *lock(&self.gets).entry(name.to_string()).or_default() += 1;

        let delay = *lock(&self.get_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = lock(&self.failing_gets).contains(name);
        if failing {
            return Err(injected_failure(name));
        }
        self.inner.get(name).await
    }

    async fn attributes(&self, name: &str) -> Result<ObjectAttributes, BucketError> {
        self.inner.attributes(name).await
    }

    async fn upload(&self, name: &str, data: Bytes) -> Result<(), BucketError> {
        self.inner.upload(name, data).await
    }

    async fn delete(&self, name: &str) -> Result<(), BucketError> {
        self.inner.delete(name).await
    }
}

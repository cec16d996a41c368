pub mod bucket;
pub mod cli;
pub mod config;
pub mod storage;

pub use bucket::{Bucket, BucketError, ObjectAttributes, ObjectStoreBucket, TenantBucket};
pub use config::Configuration;

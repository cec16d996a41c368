use anyhow::{Context, Result};
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory};
use std::sync::Arc;
use url::Url;

use crate::bucket::{Bucket, ObjectStoreBucket};
use crate::config::StorageConfig;

/// Open the bucket described by the storage configuration.
pub fn open_bucket(storage_config: &StorageConfig) -> Result<Arc<dyn Bucket>> {
    let store = create_object_store_from_dsn(&storage_config.dsn)?;
    Ok(Arc::new(ObjectStoreBucket::new(store)))
}

/// Create an object store from a DSN.
///
/// Supported forms:
/// - `memory://`
/// - `file:///absolute/path` or `file:///.relative/path`
/// - `s3://[access_key:secret_key@]host[:port]/bucket`
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url = Url::parse(dsn).with_context(|| format!("Invalid storage DSN '{dsn}'"))?;

    match url.scheme() {
        "memory" => Ok(Arc::new(InMemory::new())),
        "file" => {
            let dir = local_dir_from_url(&url)?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create storage directory {dir}"))?;
            let store = LocalFileSystem::new_with_prefix(&dir)
                .with_context(|| format!("Failed to open storage directory {dir}"))?;
            Ok(Arc::new(store))
        }
        "s3" => {
            let store = s3_builder_from_url(&url)?
                .build()
                .context("Failed to build S3 object store")?;
            Ok(Arc::new(store))
        }
        scheme => {
            anyhow::bail!("Unsupported storage scheme: {scheme}. Supported: file, memory, s3")
        }
    }
}

/// `file:///.data/blocks` is relative to the working directory, every other
/// path is taken as absolute.
fn local_dir_from_url(url: &Url) -> Result<String> {
    let path = url.path();
    if path.is_empty() || path == "/" {
        anyhow::bail!("File DSN must specify a path: file:///path/to/storage");
    }

    Ok(match path.strip_prefix("/.") {
        Some(relative) => format!(".{relative}"),
        None => path.to_string(),
    })
}

fn s3_builder_from_url(url: &Url) -> Result<AmazonS3Builder> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let bucket = url.path().trim_matches('/');
    if bucket.is_empty() {
        anyhow::bail!("S3 DSN must specify a bucket: s3://host/bucket");
    }

    // Environment first so that credentials in the DSN win.
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

    if !url.username().is_empty() {
        builder = builder
            .with_access_key_id(url.username())
            .with_secret_access_key(url.password().unwrap_or_default());
    }

    if !host.ends_with("amazonaws.com") {
        let scheme = if url.port() == Some(443) { "https" } else { "http" };
        let endpoint = match url.port() {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(scheme == "http")
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_memory_dsn() {
        assert!(create_object_store_from_dsn("memory://").is_ok());
    }

    #[tokio::test]
    async fn test_file_dsn_opens_bucket() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            dsn: format!("file://{}/blocks", temp_dir.path().display()),
        };

        let bucket = open_bucket(&config).unwrap();
        bucket
            .upload("user-1/x.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert!(temp_dir.path().join("blocks/user-1/x.json").exists());
        assert_eq!(bucket.iter("").await.unwrap(), vec!["user-1/"]);
    }

    #[test]
    fn test_local_dir_from_url() {
        let url = Url::parse("file:///.data/blocks").unwrap();
        assert_eq!(local_dir_from_url(&url).unwrap(), ".data/blocks");

        let url = Url::parse("file:///tmp/blocks").unwrap();
        assert_eq!(local_dir_from_url(&url).unwrap(), "/tmp/blocks");

        let url = Url::parse("file://").unwrap();
        assert!(local_dir_from_url(&url).is_err());
    }

    #[test]
    fn test_invalid_and_unsupported_dsn() {
        let err = create_object_store_from_dsn("not-a-url").unwrap_err();
        assert!(err.to_string().contains("Invalid storage DSN"));

        let err = create_object_store_from_dsn("gcs://bucket/prefix").unwrap_err();
        assert!(err.to_string().contains("Unsupported storage scheme"));
    }

    #[test]
    fn test_s3_dsn() {
        let url = Url::parse("s3://access:secret@localhost:9000/blocks").unwrap();
        assert!(s3_builder_from_url(&url).is_ok());

        let url = Url::parse("s3://localhost:9000/").unwrap();
        let err = s3_builder_from_url(&url).unwrap_err();
        assert!(err.to_string().contains("must specify a bucket"));
    }
}

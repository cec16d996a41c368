use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "bucket-indexer.toml";

/// Prefix of environment variable overrides, e.g.
/// `BUCKET_INDEXER__STORAGE__DSN=memory://`.
pub const ENV_PREFIX: &str = "BUCKET_INDEXER__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Object storage DSN (`file://`, `memory://` or `s3://`).
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file:///.data/blocks"),
        }
    }
}

/// Bucket index maintenance settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BucketIndexConfig {
    /// Run periodic index updates.
    ///
    /// Env: BUCKET_INDEXER__BUCKET_INDEX__ENABLED
    pub enabled: bool,

    /// Interval between two update passes of the same tenant.
    ///
    /// Env: BUCKET_INDEXER__BUCKET_INDEX__UPDATE_INTERVAL
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,

    /// Maximum number of concurrent meta.json fetches within one pass.
    ///
    /// Env: BUCKET_INDEXER__BUCKET_INDEX__META_SYNC_CONCURRENCY
    pub meta_sync_concurrency: usize,

    /// Maximum number of concurrent deletion mark fetches within one pass.
    ///
    /// Env: BUCKET_INDEXER__BUCKET_INDEX__MARK_SYNC_CONCURRENCY
    pub mark_sync_concurrency: usize,

    /// Tenants to index. Empty means every tenant found at the bucket root.
    #[serde(default)]
    pub tenants: Vec<String>,
}

impl Default for BucketIndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval: Duration::from_secs(15 * 60),
            meta_sync_concurrency: 20,
            mark_sync_concurrency: 10,
            tenants: Vec::new(),
        }
    }
}

impl BucketIndexConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.update_interval.is_zero() {
            anyhow::bail!("bucket_index.update_interval must be positive");
        }
        if self.meta_sync_concurrency == 0 {
            anyhow::bail!("bucket_index.meta_sync_concurrency must be positive");
        }
        if self.mark_sync_concurrency == 0 {
            anyhow::bail!("bucket_index.mark_sync_concurrency must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Object storage holding the tenants' blocks
    pub storage: StorageConfig,
    /// Bucket index updater settings
    pub bucket_index: BucketIndexConfig,
}

impl Configuration {
    /// Load defaults, then `bucket-indexer.toml`, then environment overrides.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Path::new(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    /// Same as [`Configuration::load`] with an explicit configuration file.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.dsn.is_empty() {
            anyhow::bail!("storage.dsn cannot be empty");
        }
        self.bucket_index.validate()
    }
}

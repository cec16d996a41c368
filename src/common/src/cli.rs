use clap::Parser;
use std::path::PathBuf;

/// CLI arguments shared by every bucket-indexer command
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

impl CommonArgs {
    /// Log level implied by the flags; `RUST_LOG` still takes precedence.
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize the tracing subscriber based on CLI arguments
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(args.default_log_level()));

        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI, then validate it
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        let config = match config_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading configuration");
                Configuration::load_from_path(path).context("Failed to load configuration")?
            }
            None => Configuration::load().context("Failed to load configuration")?,
        };

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
            return Ok(());
        }

        let index = &config.bucket_index;
        println!("Bucket Indexer Configuration:");
        println!("=============================");
        println!("Storage DSN: {}", config.storage.dsn);
        println!("Updates enabled: {}", index.enabled);
        println!("Update interval: {:?}", index.update_interval);
        println!("Meta sync concurrency: {}", index.meta_sync_concurrency);
        println!("Mark sync concurrency: {}", index.mark_sync_concurrency);
        if index.tenants.is_empty() {
            println!("Tenants: discovered from bucket");
        } else {
            println!("Tenants: {}", index.tenants.join(", "));
        }
        Ok(())
    }
}

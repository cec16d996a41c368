//! Bucket Indexer
//!
//! Keeps the per-tenant bucket index of a block storage bucket up to date.

use anyhow::{Context, Result};
use bucketindex::{UpdaterConfig, UpdaterMetrics, list_tenants, read_index, update_tenant_index};
use clap::{Parser, Subcommand};
use common::bucket::{Bucket, TenantBucket};
use common::cli::{CommonArgs, utils};
use common::config::Configuration;
use common::storage::open_bucket;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one update pass for a tenant and write its index
    Update {
        #[arg(long)]
        tenant: String,
    },
    /// Print the stored index of a tenant as JSON
    Show {
        #[arg(long)]
        tenant: String,
    },
    /// Update every tenant's index periodically until interrupted
    Run,
    /// Print the effective configuration
    Config {
        #[arg(long, help = "Print as JSON")]
        json: bool,
    },
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    match cli.command {
        Command::Update { tenant } => update_once(&config, &tenant).await,
        Command::Show { tenant } => show_index(&config, &tenant).await,
        Command::Run => run(config).await,
        Command::Config { json } => utils::display_config(&config, json),
    }
}

async fn update_once(config: &Configuration, tenant: &str) -> Result<()> {
    let bucket = open_bucket(&config.storage)?;
    let report = update_tenant_index(
        bucket,
        tenant,
        &UpdaterConfig::from(&config.bucket_index),
        &UpdaterMetrics::new(),
        &CancellationToken::new(),
    )
    .await
    .with_context(|| format!("Failed to update bucket index of tenant {tenant}"))?;

    println!(
        "Tenant {}: {} blocks, {} deletion marks, {} partial blocks",
        report.tenant,
        report.index.blocks.len(),
        report.index.block_deletion_marks.len(),
        report.partials.len()
    );
    Ok(())
}

async fn show_index(config: &Configuration, tenant: &str) -> Result<()> {
    let root = open_bucket(&config.storage)?;
    let bucket = TenantBucket::new(root, tenant);

    let index = read_index(&bucket)
        .await
        .with_context(|| format!("Failed to read bucket index of tenant {tenant}"))?;

    let json = serde_json::to_string_pretty(&index).context("Failed to serialize bucket index")?;
    println!("{json}");
    Ok(())
}

async fn run(config: Configuration) -> Result<()> {
    if !config.bucket_index.enabled {
        tracing::info!("Bucket index updates are disabled (bucket_index.enabled = false)");
        return Ok(());
    }

    let bucket = open_bucket(&config.storage)?;
    let metrics = UpdaterMetrics::new();
    let cancel = CancellationToken::new();

    tracing::info!(
        interval = ?config.bucket_index.update_interval,
        "Bucket indexer running, waiting for shutdown signal"
    );

    let update_task = {
        let bucket = bucket.clone();
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { update_loop(bucket, config, metrics, cancel).await })
    };

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutting down bucket indexer");
    cancel.cancel();

    update_task.await.context("Update loop panicked")?;
    metrics.summary().log();
    Ok(())
}

async fn update_loop(
    bucket: Arc<dyn Bucket>,
    config: Configuration,
    metrics: UpdaterMetrics,
    cancel: CancellationToken,
) {
    let updater_config = UpdaterConfig::from(&config.bucket_index);
    let mut ticker = tokio::time::interval(config.bucket_index.update_interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let tenants = if config.bucket_index.tenants.is_empty() {
            match list_tenants(bucket.as_ref()).await {
                Ok(tenants) => tenants,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to discover tenants");
                    continue;
                }
            }
        } else {
            config.bucket_index.tenants.clone()
        };

        tracing::debug!(tenants = tenants.len(), "Running bucket index update cycle");

        for tenant in &tenants {
            if cancel.is_cancelled() {
                return;
            }

            if let Err(e) =
                update_tenant_index(bucket.clone(), tenant, &updater_config, &metrics, &cancel)
                    .await
            {
                tracing::error!(tenant = %tenant, error = %e, "Failed to update bucket index");
            }
        }

        metrics.summary().log();
    }
}

//! Local cache maintenance commands.

use anyhow::{Context, Result};
use clap::Args;

use vstore_cache::{DiskStore, KeySpace, StoreStats};
use vstore_config::{log_cli_info, Config};

#[derive(Args)]
pub struct PruneArgs {
    /// Size budget in bytes (defaults to cache.max_bytes)
    #[arg(long)]
    pub max_bytes: Option<u64>,

    /// Only report what would be removed
    #[arg(long)]
    pub dry_run: bool,
}

fn open(config: &Config) -> Result<DiskStore> {
    if config.cache.ephemeral {
        anyhow::bail!("cache is configured as ephemeral; nothing on disk to inspect");
    }
    DiskStore::open(&config.cache.root)
        .with_context(|| format!("Failed to open cache at {}", config.cache.root.display()))
}

pub async fn stats(config: &Config) -> Result<()> {
    let store = open(config)?;
    let stats = tokio::task::spawn_blocking(move || store.stats())
        .await
        .context("Cache scan task failed")??;

    println!("Cache: {}", config.cache.root.display());
    for line in format_stats(&stats) {
        println!("{}", line);
    }
    Ok(())
}

pub async fn prune(config: &Config, args: PruneArgs) -> Result<()> {
    let budget = args
        .max_bytes
        .or(config.cache.max_bytes)
        .context("No size budget: pass --max-bytes or set cache.max_bytes")?;
    let store = open(config)?;

    if args.dry_run {
        let stats = tokio::task::spawn_blocking(move || store.stats())
            .await
            .context("Cache scan task failed")??;
        let total = stats.total_bytes();
        println!(
            "Cache holds {} in {} records; budget {} (would free {})",
            format_bytes(total),
            stats.total_records(),
            format_bytes(budget),
            format_bytes(total.saturating_sub(budget)),
        );
        return Ok(());
    }

    let report = tokio::task::spawn_blocking(move || store.prune(budget))
        .await
        .context("Prune task failed")??;

    log_cli_info!(
        "Cache pruned",
        removed = report.removed,
        bytes_before = report.bytes_before,
        bytes_after = report.bytes_after,
    );
    println!(
        "Removed {} records: {} -> {}",
        report.removed,
        format_bytes(report.bytes_before),
        format_bytes(report.bytes_after),
    );
    Ok(())
}

fn format_stats(stats: &StoreStats) -> Vec<String> {
    let mut lines: Vec<String> = KeySpace::ALL
        .iter()
        .map(|space| {
            let s = stats.space(*space);
            format!(
                "  {:<12} {:>8} records  {:>10}",
                space.dir_name(),
                s.records,
                format_bytes(s.bytes)
            )
        })
        .collect();
    lines.push(format!(
        "  {:<12} {:>8} records  {:>10}",
        "total",
        stats.total_records(),
        format_bytes(stats.total_bytes())
    ));
    lines
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

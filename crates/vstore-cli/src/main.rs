//! # vstore CLI
//!
//! Diagnostic front end for the backing store: fetch objects by hash, look
//! at the local cache, and print the effective configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vstore_config::logging::{init_logging, LogLevel};
use vstore_config::{log_cli_info, Config};

mod cache;
mod inspect;

/// vstore - object retrieval for a virtual source-control filesystem
#[derive(Parser)]
#[command(name = "vstore")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Project config file layered over ~/.vstore/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Local cache directory (overrides config and VSTORE_CACHE_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a blob's content to stdout
    CatBlob(inspect::HashArgs),

    /// List a tree's entries
    LsTree(inspect::HashArgs),

    /// List the root tree of a commit
    CommitTree(inspect::CommitArgs),

    /// List the root tree named by a manifest hash
    ManifestTree(inspect::ManifestArgs),

    /// Fetch blobs into the local cache
    Prefetch(inspect::PrefetchArgs),

    /// Show record counts and sizes per cache key space
    CacheStats,

    /// Evict least recently written records down to a size budget
    Prune(cache::PruneArgs),

    /// Print the effective configuration as TOML
    ShowConfig {
        /// Print built-in defaults instead
        #[arg(long)]
        defaults: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    let config = load_config(&cli)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async_main(cli.command, config))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let global = Config::global_config_path();
            let mut config = Config::load_from(global.as_deref(), Some(path))
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config
        }
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(dir) = &cli.cache_dir {
        config.cache.root = dir.clone();
    }
    config.validate()?;
    log_cli_info!(
        "Configuration loaded",
        cache_root = tracing::field::display(config.cache.root.display()),
        backends = config.active_backends().len(),
    );
    Ok(config)
}

async fn async_main(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::CatBlob(args) => inspect::cat_blob(&config, args).await,
        Commands::LsTree(args) => inspect::ls_tree(&config, args).await,
        Commands::CommitTree(args) => inspect::commit_tree(&config, args).await,
        Commands::ManifestTree(args) => inspect::manifest_tree(&config, args).await,
        Commands::Prefetch(args) => inspect::prefetch(&config, args).await,
        Commands::CacheStats => cache::stats(&config).await,
        Commands::Prune(args) => cache::prune(&config, args).await,
        Commands::ShowConfig { defaults } => {
            if defaults {
                print!("{}", Config::default_toml());
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&config).context("Failed to render config")?
                );
            }
            Ok(())
        }
    }
}

//! Object fetch commands.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;

use vstore_config::Config;
use vstore_fetch::{BackingStore, FetchCause, ObjectFetchContext};
use vstore_model::{CommitId, Hash, Tree};

#[derive(Args)]
pub struct HashArgs {
    /// Object hash (64 hex characters)
    pub hash: Hash,
}

#[derive(Args)]
pub struct CommitArgs {
    /// Commit identifier in hex
    pub commit: CommitId,
}

#[derive(Args)]
pub struct ManifestArgs {
    /// Commit identifier in hex
    pub commit: CommitId,

    /// Hash of the root manifest tree
    pub manifest: Hash,
}

#[derive(Args)]
pub struct PrefetchArgs {
    /// Blob hashes to fetch
    #[arg(required = true)]
    pub hashes: Vec<Hash>,

    /// Print the per-request counters afterwards
    #[arg(long)]
    pub stats: bool,
}

fn open(config: &Config) -> Result<BackingStore> {
    BackingStore::from_config(config).context("Failed to open backing store")
}

fn cli_context() -> ObjectFetchContext {
    ObjectFetchContext::new(FetchCause::Cli).with_client_pid(std::process::id())
}

pub async fn cat_blob(config: &Config, args: HashArgs) -> Result<()> {
    let store = open(config)?;
    let blob = store
        .get_blob(&args.hash, &cli_context())
        .await
        .with_context(|| format!("Failed to fetch blob {}", args.hash))?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(blob.data())?;
    stdout.flush()?;
    Ok(())
}

pub async fn ls_tree(config: &Config, args: HashArgs) -> Result<()> {
    let store = open(config)?;
    let tree = store
        .get_tree(&args.hash, &cli_context())
        .await
        .with_context(|| format!("Failed to fetch tree {}", args.hash))?;
    print_tree(&tree)
}

pub async fn commit_tree(config: &Config, args: CommitArgs) -> Result<()> {
    let store = open(config)?;
    let tree = store
        .get_tree_for_commit(&args.commit, &cli_context())
        .await
        .with_context(|| format!("Failed to fetch root tree of commit {}", args.commit))?;
    println!("tree {}", tree.hash());
    print_tree(&tree)
}

pub async fn manifest_tree(config: &Config, args: ManifestArgs) -> Result<()> {
    let store = open(config)?;
    let tree = store
        .get_tree_for_manifest(&args.commit, &args.manifest, &cli_context())
        .await
        .with_context(|| {
            format!(
                "Failed to fetch manifest {} of commit {}",
                args.manifest, args.commit
            )
        })?;
    print_tree(&tree)
}

pub async fn prefetch(config: &Config, args: PrefetchArgs) -> Result<()> {
    let store = open(config)?;
    let ctx = ObjectFetchContext::new(FetchCause::Prefetch).with_client_pid(std::process::id());
    let results = store.prefetch_blobs(args.hashes, &ctx).await;

    let mut failed = 0usize;
    for (hash, result) in &results {
        match result {
            Ok(()) => println!("ok      {}", hash),
            Err(e) => {
                failed += 1;
                println!("failed  {}  {}", hash, e);
            }
        }
    }

    if args.stats {
        let stats = store.stats();
        println!();
        println!("cache hits:      {}", stats.cache_hits);
        println!("cache misses:    {}", stats.cache_misses);
        println!("coalesced:       {}", stats.coalesced);
        println!("backend fetches: {}", stats.backend_fetches);
        println!("fallbacks:       {}", stats.fallbacks);
    }

    if failed > 0 {
        anyhow::bail!("{} of {} blobs could not be fetched", failed, results.len());
    }
    Ok(())
}

fn print_tree(tree: &Tree) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for line in format_entries(tree) {
        writeln!(stdout, "{}", line)?;
    }
    Ok(())
}

fn format_entries(tree: &Tree) -> Vec<String> {
    tree.entries()
        .iter()
        .map(|entry| format!("{} {} {}", entry.kind.tag(), entry.hash, entry.name))
        .collect()
}

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use bcache::{BlockCache, BlockDevice, FileBlockDevice, Notifier, NotifierConfig};
use bcache_types::{BlockNumber, BlockSize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const BLOCK_SIZE: u32 = 4096;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("smoke") => smoke(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn print_usage() {
    println!("bcache-harness — exercise the transactional block cache");
    println!();
    println!("commands:");
    println!("  smoke [image] [blocks]   run a transactional workload against a file image");
    println!("                           (default: 4096-block temp image)");
}

/// Transactional workload: commit, abort, sub-transaction detach, then a
/// full sync, verifying the reread bytes and printing counters.
fn smoke(args: &[String]) -> Result<()> {
    let blocks: u64 = match args.get(1) {
        Some(raw) => raw.parse().context("blocks must be an integer")?,
        None => 4096,
    };

    let _tmp;
    let image: PathBuf = match args.first() {
        Some(path) => PathBuf::from(path),
        None => {
            let dir = tempfile::tempdir().context("create temp dir")?;
            let path = dir.path().join("smoke.img");
            _tmp = dir;
            path
        }
    };
    if !image.exists() {
        std::fs::write(&image, vec![0_u8; blocks as usize * BLOCK_SIZE as usize])
            .with_context(|| format!("create image {}", image.display()))?;
    }

    let started = Instant::now();
    let cache = open_cache(&image, blocks)?;
    let notifier = Notifier::start(NotifierConfig::default());
    notifier.register(&cache);

    // Committed transaction over the first quarter of the image.
    let committed = blocks / 4;
    let txn = cache.start_transaction().context("start transaction")?;
    for block in 0..committed {
        let guard = cache
            .get_empty(BlockNumber(block), Some(txn))
            .with_context(|| format!("stage block {block}"))?;
        guard.data().write().fill(pattern(block));
    }
    cache
        .end_transaction(txn, None)
        .context("end transaction")?;

    // Aborted transaction over the next quarter; none of it may land.
    let aborted_base = committed;
    let txn = cache.start_transaction().context("start abort txn")?;
    for block in aborted_base..aborted_base + committed {
        let guard = cache
            .get_empty(BlockNumber(block), Some(txn))
            .with_context(|| format!("stage block {block}"))?;
        guard.data().write().fill(0xFF);
    }
    cache.abort_transaction(txn).context("abort transaction")?;

    // Sub-transaction split on a handful of blocks.
    let txn = cache.start_transaction().context("start sub txn")?;
    let sub_base = 2 * committed;
    for block in sub_base..sub_base + 4 {
        let guard = cache
            .get_empty(BlockNumber(block), Some(txn))
            .with_context(|| format!("stage block {block}"))?;
        guard.data().write().fill(0x10);
    }
    cache.start_sub_transaction(txn).context("start sub")?;
    for block in sub_base..sub_base + 2 {
        let guard = cache
            .get_writable(BlockNumber(block), Some(txn))
            .with_context(|| format!("sub-modify block {block}"))?;
        guard.data().write().fill(0x11);
    }
    let detached = cache.detach_sub_transaction(txn).context("detach sub")?;
    cache
        .end_transaction(detached, None)
        .context("end detached")?;

    cache.sync().context("sync")?;

    // Verify through a cold cache.
    drop(cache);
    notifier.shutdown();
    let cache = open_cache(&image, blocks)?;
    for block in 0..committed {
        let guard = cache
            .get(BlockNumber(block))
            .with_context(|| format!("reread block {block}"))?;
        let ok = guard.data().read().iter().all(|&b| b == pattern(block));
        if !ok {
            bail!("block {block} holds unexpected bytes after reopen");
        }
    }
    for block in aborted_base..aborted_base + committed {
        let guard = cache
            .get(BlockNumber(block))
            .with_context(|| format!("reread block {block}"))?;
        if guard.data().read().iter().any(|&b| b == 0xFF) {
            bail!("aborted bytes leaked into block {block}");
        }
    }

    let metrics = cache.metrics();
    let stats = cache.stats();
    println!("smoke ok in {:?}", started.elapsed());
    println!(
        "  cached_blocks={} cached_bytes={} dirty={} capacity={}",
        metrics.cached_blocks, metrics.cached_bytes, metrics.dirty_blocks, metrics.capacity_bytes
    );
    println!(
        "  hits={} misses={} evictions={} insertions={}",
        stats.hits, stats.misses, stats.evictions, stats.insertions
    );
    Ok(())
}

fn open_cache(image: &Path, blocks: u64) -> Result<BlockCache> {
    let block_size = BlockSize::new(BLOCK_SIZE).context("block size")?;
    let device = FileBlockDevice::open(image, block_size)
        .with_context(|| format!("open image {}", image.display()))?;
    let capacity = (blocks as usize / 2).max(64) * BLOCK_SIZE as usize;
    BlockCache::new(Arc::new(device) as Arc<dyn BlockDevice>, capacity, false)
        .context("create cache")
}

fn pattern(block: u64) -> u8 {
    (block % 251) as u8
}

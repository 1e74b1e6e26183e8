//! fibstore consistency checker
//!
//! Opens (or creates) a store and verifies its allocator invariants,
//! optionally after a random allocation churn.

use anyhow::{bail, Context};
use clap::Parser;
use fibstore::{FileStore, Loc, ObjectId, StoreConfig};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fibstore-check")]
#[command(about = "Consistency checks for a fibstore object store")]
struct Args {
    /// File prefix; the store lives in `{prefix}index` and `{prefix}data`
    #[arg(short = 'p', long)]
    prefix: PathBuf,

    /// TOML store configuration
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Discard existing content before checking
    #[arg(long)]
    reset: bool,

    /// Allocate this many random objects before checking
    #[arg(long, default_value = "0")]
    churn: usize,

    /// Largest object size used by the churn
    #[arg(long, default_value = "2048")]
    max_size: u64,

    /// Seed for the churn
    #[arg(long)]
    seed: Option<u64>,

    /// Overwrite every live object with a test pattern (destroys contents)
    #[arg(long)]
    pattern: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };

    let mut store = FileStore::load(&args.prefix, config)
        .with_context(|| format!("opening store at {}", args.prefix.display()))?;
    if args.reset {
        store.reset()?;
    }

    info!(
        objects = store.object_count(),
        data_size = store.data_size(),
        "Opened store"
    );

    check_conservation(&store)?;
    check_no_overlap(&store)?;

    if args.churn > 0 {
        if args.max_size < 8 {
            bail!("--max-size must be at least 8");
        }
        let seed = args.seed.unwrap_or_else(rand::random);
        info!(seed, count = args.churn, "Running churn");
        churn(&mut store, args.churn, args.max_size, seed)?;
        check_conservation(&store)?;
        check_no_overlap(&store)?;
    }

    if args.pattern {
        check_pattern(&mut store)?;
    }

    store.log()?;
    store.close()?;
    println!("ok");
    Ok(())
}

/// Free bytes plus live bytes must cover the data file exactly
fn check_conservation(store: &FileStore) -> anyhow::Result<()> {
    let free = store.count_free_bytes()?;
    let live: u64 = store.objects().map(|(_, loc)| loc.block_bytes()).sum();
    if free + live != store.data_size() {
        bail!(
            "conservation violated: {} free + {} live != {} data bytes",
            free,
            live,
            store.data_size()
        );
    }
    info!(free, live, "Conservation holds");
    Ok(())
}

/// No two live objects share a byte
fn check_no_overlap(store: &FileStore) -> anyhow::Result<()> {
    let mut live: Vec<(ObjectId, Loc)> = store.objects().collect();
    live.sort_by_key(|(_, loc)| loc.offset());
    for pair in live.windows(2) {
        let ((a_id, a), (b_id, b)) = (pair[0], pair[1]);
        if a.overlaps(b) {
            bail!("object {} at {} overlaps object {} at {}", a_id, a, b_id, b);
        }
    }
    info!(objects = live.len(), "No overlapping objects");
    Ok(())
}

/// Fill, decrement, verify
fn check_pattern(store: &mut FileStore) -> anyhow::Result<()> {
    let ids: Vec<ObjectId> = store.objects().map(|(id, _)| id).collect();
    let tag = |id: ObjectId| (id.get() % 255) as u8 + 1;

    for &id in &ids {
        store.object_mut(id)?.fill(tag(id));
    }
    for &id in &ids {
        store.object_mut(id)?.iter_mut().for_each(|b| *b -= 1);
    }
    for &id in &ids {
        let expected = tag(id) - 1;
        if store.object(id)?.iter().any(|&b| b != expected) {
            bail!("object {} was overwritten by another object", id);
        }
    }
    info!(objects = ids.len(), "Pattern check passed");
    Ok(())
}

/// Random allocations, a random half freed, then an alloc/free cycle that
/// must leave the free byte count unchanged
fn churn(store: &mut FileStore, count: usize, max_size: u64, seed: u64) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(store.new_object(rng.gen_range(8..=max_size))?);
    }

    ids.shuffle(&mut rng);
    for id in ids.drain(..count / 2) {
        store.delete_object(id)?;
    }

    let size = store.data_size();
    let free_before = store.count_free_bytes()?;
    let cycle: Vec<ObjectId> = (0..count / 4)
        .map(|_| store.new_object(rng.gen_range(8..=max_size)))
        .collect::<fibstore::Result<_>>()?;
    for id in cycle {
        store.delete_object(id)?;
    }

    let free_after = store.count_free_bytes()?;
    let grown = store.data_size() - size;
    if free_after != free_before + grown {
        bail!(
            "free bytes drifted across an alloc/free cycle: {} before, {} after, {} grown",
            free_before,
            free_after,
            grown
        );
    }
    Ok(())
}

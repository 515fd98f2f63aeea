use anyhow::{Context, Result};
use clap::Parser;
use revgraph::constants::ENV_RAYON_THREADS;
use revgraph::{DestFilter, ExecMode, Pipeline, PipelineConfig};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Compute the inverse adjacency lists (OUT1) and in-degrees (OUT2) of a directed graph.
#[derive(Parser, Debug)]
#[command(name = "revgraph", version)]
struct Args {
    /// Input edge list, one "<source> <destination>" per line
    infile: PathBuf,
    /// Number of mappers (1-20)
    m: usize,
    /// Number of reducers (1-10)
    r: usize,
    /// Output: "<destination>: <sources...>" per line
    out1: PathBuf,
    /// Output: "<destination> <count>" per line
    out2: PathBuf,
    /// Smallest destination kept, or -1 for unbounded
    #[arg(allow_negative_numbers = true)]
    mind: i64,
    /// Largest destination kept, or -1 for unbounded
    #[arg(allow_negative_numbers = true)]
    maxd: i64,
    /// Shuffle region size as a power of two (bytes = 2^SHMSIZE)
    shmsize: u32,
    /// Run workers as processes or threads
    #[arg(long, default_value = "process")]
    mode: ExecMode,
    /// Directory receiving the per-run scratch directory
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Directory for the shared region backing file (process mode)
    #[arg(long)]
    shm_dir: Option<PathBuf>,
    /// Keep partition, bucket and run files after the run
    #[arg(long)]
    keep_intermediates: bool,
    /// Write the run report as JSON to this path
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    // Before worker dispatch: reducers sort inside worker processes.
    configure_rayon();

    // Worker processes are this same binary with a task in the environment.
    if let Some(outcome) = revgraph::worker::run_from_env() {
        return outcome;
    }

    let args = Args::parse();

    let filter = DestFilter::from_bounds(args.mind, args.maxd)?;
    let mut config = PipelineConfig::new(&args.infile, args.m, args.r, &args.out1, &args.out2, filter, args.shmsize)
        .with_mode(args.mode);
    if let Some(dir) = args.work_dir {
        config = config.with_work_dir(dir);
    }
    if let Some(dir) = args.shm_dir {
        config = config.with_shm_dir(Some(dir));
    }
    if args.keep_intermediates {
        config = config.with_keep_intermediates(true);
    }

    let report = Pipeline::new(config)?.run()?;

    if let Some(path) = args.stats_json {
        let json = serde_json::to_vec_pretty(&report)?;
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

fn configure_rayon() {
    if std::env::var("RAYON_NUM_THREADS").is_ok() {
        return;
    }
    let threads = std::env::var(ENV_RAYON_THREADS).ok().and_then(|v| v.parse::<usize>().ok()).filter(|&n| n > 0);
    if let Some(n) = threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(n).build_global() {
            warn!(error = %e, "could not size rayon pool");
        }
    }
}

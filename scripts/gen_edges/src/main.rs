use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Sizes used for benchmarking the pipeline.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Tiny,
    Small,
    Medium,
    Large,
    Xlarge,
    Huge,
}

impl Preset {
    /// (edges, max vertex)
    fn dims(self) -> (u64, u64) {
        match self {
            Preset::Tiny => (100, 50),
            Preset::Small => (1_000, 100),
            Preset::Medium => (10_000, 1_000),
            Preset::Large => (100_000, 5_000),
            Preset::Xlarge => (500_000, 10_000),
            Preset::Huge => (1_000_000, 50_000),
        }
    }
}

#[derive(Parser, Debug)]
struct Args {
    /// Output edge-list file
    #[arg(long)]
    output: PathBuf,
    /// Named size; --edges and --max-vertex override its values
    #[arg(long, value_enum)]
    preset: Option<Preset>,
    /// Number of edges to write
    #[arg(long)]
    edges: Option<u64>,
    /// Vertices are drawn uniformly from [1, max_vertex]
    #[arg(long)]
    max_vertex: Option<u64>,
    /// Seed for reproducible output
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let (preset_edges, preset_max) = args.preset.map(Preset::dims).unwrap_or((1_000, 100_000));
    let edges = args.edges.unwrap_or(preset_edges);
    let max_vertex = args.max_vertex.unwrap_or(preset_max);
    if max_vertex == 0 {
        bail!("--max-vertex must be at least 1");
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = File::create(&args.output).with_context(|| format!("create {}", args.output.display()))?;
    let mut w = BufWriter::with_capacity(1 << 20, file);
    for _ in 0..edges {
        let source = rng.gen_range(1..=max_vertex);
        let dest = rng.gen_range(1..=max_vertex);
        writeln!(w, "{} {}", source, dest)?;
    }
    w.flush().with_context(|| format!("flush {}", args.output.display()))?;

    info!(path = %args.output.display(), edges, max_vertex, "Generated edge list");
    Ok(())
}

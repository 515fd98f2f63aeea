//! Centralized environment variable names, bounds and default values for the revgraph runtime.

// Environment variable names
pub const ENV_KEEP_INTERMEDIATES: &str = "REVGRAPH_KEEP_INTERMEDIATES";
pub const ENV_WORK_DIR: &str = "REVGRAPH_WORK_DIR";
pub const ENV_SHM_DIR: &str = "REVGRAPH_SHM_DIR";
pub const ENV_RAYON_THREADS: &str = "REVGRAPH_RAYON_THREADS";
pub const ENV_LOCAL_BATCH_BYTES: &str = "REVGRAPH_LOCAL_BATCH_BYTES";
/// Set on re-executed worker processes; holds the JSON-encoded task.
pub const ENV_WORKER_TASK: &str = "REVGRAPH_WORKER_TASK";

// Bounds on the command-line surface
pub const MAX_MAPPERS: usize = 20;
pub const MAX_REDUCERS: usize = 10;
pub const MAX_REGION_EXPONENT: u32 = 40;

/// Destination bound meaning "unbounded" on the command line.
pub const UNBOUNDED: i64 = -1;

// Defaults
/// Per-bucket batch a mapper accumulates before handing bytes to the file writer.
pub const DEFAULT_LOCAL_BATCH_BYTES: usize = 256 * 1024; // 256 KiB
/// Buffer size for run/output writers.
pub const OUTPUT_BUF_BYTES: usize = 4 * 1024 * 1024; // 4 MiB
/// Directory (under the work dir) holding one subdirectory per run.
pub const RUNS_DIR: &str = ".revgraph_runs";
/// Preferred location of the process-mode region backing file.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

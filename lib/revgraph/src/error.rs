use std::path::PathBuf;
use thiserror::Error;

/// Problems detected before any pipeline artifact is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("M must be between 1 and {max} (got {got})")]
    Mappers { got: usize, max: usize },
    #[error("R must be between 1 and {max} (got {got})")]
    Reducers { got: usize, max: usize },
    #[error("SHMSIZE must be between 0 and {max} (got {got})")]
    RegionExponent { got: u32, max: u32 },
    #[error("shuffle region of 2^{exponent} bytes cannot hold the header for {reducers} reducers ({header} bytes)")]
    RegionTooSmall { exponent: u32, reducers: usize, header: usize },
    #[error("{name} must be -1 (unbounded) or a non-negative destination (got {got})")]
    Bound { name: &'static str, got: i64 },
    #[error("MIND ({min}) is greater than MAXD ({max})")]
    InvertedRange { min: u64, max: u64 },
    #[error("input {} is not a readable file", .0.display())]
    Input(PathBuf),
}

/// Fatal stage failures observed by the coordinator.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("could not start {stage} worker {index} after retry: {source}")]
    Spawn {
        stage: &'static str,
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("{stage} stage failed: {}", .failures.join("; "))]
    WorkersFailed { stage: &'static str, failures: Vec<String> },
}

/// Shuffle Region layout violations.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("region of {len} bytes is smaller than its {header}-byte header")]
    TooSmall { len: usize, header: usize },
    #[error("region header declares {found} reducers, expected {expected}")]
    ReducerCount { found: usize, expected: usize },
    #[error("region offset table is inconsistent: {0}")]
    Offsets(String),
    #[error("reducer {index} has no span in a region with {reducers} reducers")]
    NoSuchSpan { index: usize, reducers: usize },
}

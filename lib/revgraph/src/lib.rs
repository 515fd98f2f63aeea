//! Inverse adjacency of a directed graph through a single-machine map/reduce
//! pipeline with a partition-by-destination shuffle.
//!
//! For every destination vertex the pipeline writes the sorted set of distinct
//! sources pointing to it (OUT1) and the size of that set (OUT2).

pub mod config;
pub mod constants;
pub mod edge;
pub mod error;
pub mod io;
pub mod map;
pub mod merge;
pub mod partition;
pub mod reduce;
pub mod region;
pub mod runtime;
pub mod stats;
pub mod summary;
pub mod utils;
pub mod worker;
pub mod workspace;

pub use config::{DestFilter, ExecMode, PipelineConfig};
pub use error::{ConfigError, RegionError, StageError};
pub use region::{ShuffleRegion, SpanWriter};
pub use runtime::Pipeline;
pub use stats::RunReport;
pub use workspace::Workspace;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_LOCAL_BATCH_BYTES, DEFAULT_SHM_DIR, ENV_KEEP_INTERMEDIATES, ENV_LOCAL_BATCH_BYTES, ENV_SHM_DIR, ENV_WORK_DIR,
    MAX_MAPPERS, MAX_REDUCERS, MAX_REGION_EXPONENT, UNBOUNDED,
};
use crate::error::ConfigError;
use crate::region::header_size;
use crate::utils::env_var_truthy;

/// How stage workers are realised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// One OS process per worker; the Shuffle Region is a shared file mapping.
    Process,
    /// One thread per worker; the Shuffle Region is an anonymous mapping.
    Thread,
}

impl std::str::FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(ExecMode::Process),
            "thread" => Ok(ExecMode::Thread),
            other => Err(format!("unknown mode '{}', expected 'process' or 'thread'", other)),
        }
    }
}

/// Inclusive destination bounds; `None` means unbounded on that side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestFilter {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl DestFilter {
    /// Build from command-line bounds where `-1` means unbounded.
    pub fn from_bounds(min: i64, max: i64) -> Result<Self, ConfigError> {
        let min = bound("MIND", min)?;
        let max = bound("MAXD", max)?;
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(ConfigError::InvertedRange { min: lo, max: hi });
            }
        }
        Ok(Self { min, max })
    }

    pub fn accepts(&self, dest: u64) -> bool {
        self.min.map_or(true, |lo| dest >= lo) && self.max.map_or(true, |hi| dest <= hi)
    }
}

fn bound(name: &'static str, v: i64) -> Result<Option<u64>, ConfigError> {
    match v {
        UNBOUNDED => Ok(None),
        v if v >= 0 => Ok(Some(v as u64)),
        got => Err(ConfigError::Bound { name, got }),
    }
}

/// Everything a pipeline run needs, validated once up front.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub mappers: usize,
    pub reducers: usize,
    /// OUT1: inverse adjacency lists.
    pub out_adjacency: PathBuf,
    /// OUT2: in-degree counts.
    pub out_counts: PathBuf,
    pub filter: DestFilter,
    pub region_exponent: u32,
    pub mode: ExecMode,
    /// Parent of the per-run scratch directory.
    pub work_dir: PathBuf,
    /// Where the process-mode region backing file lives; `None` means the run directory.
    pub shm_dir: Option<PathBuf>,
    pub keep_intermediates: bool,
    pub local_batch_bytes: usize,
}

impl PipelineConfig {
    /// Config with environment-derived defaults for everything outside the positional surface.
    /// Runs in [`ExecMode::Thread`]; process mode re-executes the host binary, which must
    /// dispatch through [`crate::worker::run_from_env`], so callers opt in with [`Self::with_mode`].
    pub fn new(
        input: impl Into<PathBuf>,
        mappers: usize,
        reducers: usize,
        out_adjacency: impl Into<PathBuf>,
        out_counts: impl Into<PathBuf>,
        filter: DestFilter,
        region_exponent: u32,
    ) -> Self {
        let work_dir = std::env::var_os(ENV_WORK_DIR).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let shm_dir = std::env::var_os(ENV_SHM_DIR).map(PathBuf::from).or_else(|| {
            let p = Path::new(DEFAULT_SHM_DIR);
            p.is_dir().then(|| p.to_path_buf())
        });
        let local_batch_bytes = std::env::var(ENV_LOCAL_BATCH_BYTES)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_LOCAL_BATCH_BYTES);
        Self {
            input: input.into(),
            mappers,
            reducers,
            out_adjacency: out_adjacency.into(),
            out_counts: out_counts.into(),
            filter,
            region_exponent,
            mode: ExecMode::Thread,
            work_dir,
            shm_dir,
            keep_intermediates: env_var_truthy(ENV_KEEP_INTERMEDIATES),
            local_batch_bytes,
        }
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_shm_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.shm_dir = dir;
        self
    }

    pub fn with_keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }

    pub fn region_size(&self) -> usize {
        1usize << self.region_exponent
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_MAPPERS).contains(&self.mappers) {
            return Err(ConfigError::Mappers { got: self.mappers, max: MAX_MAPPERS });
        }
        if !(1..=MAX_REDUCERS).contains(&self.reducers) {
            return Err(ConfigError::Reducers { got: self.reducers, max: MAX_REDUCERS });
        }
        if self.region_exponent > MAX_REGION_EXPONENT {
            return Err(ConfigError::RegionExponent { got: self.region_exponent, max: MAX_REGION_EXPONENT });
        }
        let header = header_size(self.reducers);
        if self.region_size() < header {
            return Err(ConfigError::RegionTooSmall { exponent: self.region_exponent, reducers: self.reducers, header });
        }
        if let (Some(lo), Some(hi)) = (self.filter.min, self.filter.max) {
            if lo > hi {
                return Err(ConfigError::InvertedRange { min: lo, max: hi });
            }
        }
        if !self.input.is_file() || std::fs::File::open(&self.input).is_err() {
            return Err(ConfigError::Input(self.input.clone()));
        }
        Ok(())
    }
}

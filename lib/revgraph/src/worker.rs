//! Work units shipped to worker processes.
//!
//! In process mode the coordinator re-executes its own binary with the task
//! serialized into [`ENV_WORKER_TASK`]. The worker prints one JSON
//! [`WorkerReport`] line on stdout and exits 0; anything else is a failure.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

use crate::constants::ENV_WORKER_TASK;
use crate::map::{run_mapper, MapTaskStats};
use crate::reduce::{run_reducer, ReduceTaskStats};
use crate::region::ShuffleRegion;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerTask {
    Map {
        mapper: usize,
        partition: PathBuf,
        buckets: Vec<PathBuf>,
        batch_bytes: usize,
    },
    Reduce {
        reducer: usize,
        reducers: usize,
        buckets: Vec<PathBuf>,
        run: PathBuf,
        region: PathBuf,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerReport {
    Map(MapTaskStats),
    Reduce(ReduceTaskStats),
}

impl WorkerReport {
    pub fn stage(&self) -> &'static str {
        match self {
            WorkerReport::Map(_) => "map",
            WorkerReport::Reduce(_) => "reduce",
        }
    }

    pub fn into_map(self) -> Result<MapTaskStats> {
        match self {
            WorkerReport::Map(s) => Ok(s),
            other => Err(anyhow!("expected a map report, got a {} report", other.stage())),
        }
    }

    pub fn into_reduce(self) -> Result<ReduceTaskStats> {
        match self {
            WorkerReport::Reduce(s) => Ok(s),
            other => Err(anyhow!("expected a reduce report, got a {} report", other.stage())),
        }
    }
}

impl WorkerTask {
    pub fn stage(&self) -> &'static str {
        match self {
            WorkerTask::Map { .. } => "map",
            WorkerTask::Reduce { .. } => "reduce",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            WorkerTask::Map { mapper, .. } => *mapper,
            WorkerTask::Reduce { reducer, .. } => *reducer,
        }
    }

    /// Execute the task in this process.
    pub fn run(&self) -> Result<WorkerReport> {
        match self {
            WorkerTask::Map { mapper, partition, buckets, batch_bytes } => {
                run_mapper(*mapper, partition, buckets, *batch_bytes).map(WorkerReport::Map)
            }
            WorkerTask::Reduce { reducer, reducers, buckets, run, region } => {
                let mut shared = ShuffleRegion::attach(region, *reducers)?;
                let stats = {
                    let mut span = shared.span_writer(*reducer)?;
                    run_reducer(*reducer, buckets, run, &mut span)?
                };
                shared.flush()?;
                Ok(WorkerReport::Reduce(stats))
            }
        }
    }
}

/// If this process was started as a worker, run its task and return the outcome;
/// `None` means this is a normal invocation.
pub fn run_from_env() -> Option<Result<()>> {
    let raw = std::env::var(ENV_WORKER_TASK).ok()?;
    Some(run_encoded(&raw))
}

fn run_encoded(raw: &str) -> Result<()> {
    let task: WorkerTask = serde_json::from_str(raw).context("decode worker task")?;
    debug!(stage = task.stage(), index = task.index(), "worker starting");
    let report = task.run().with_context(|| format!("{} worker {}", task.stage(), task.index()))?;
    let line = serde_json::to_string(&report)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}

/// Decode the report a worker printed; the last non-empty stdout line wins.
pub fn parse_report(stdout: &[u8]) -> Result<WorkerReport> {
    let text = std::str::from_utf8(stdout).context("worker report is not UTF-8")?;
    let line = text.lines().rev().find(|l| !l.trim().is_empty()).context("worker printed no report")?;
    serde_json::from_str(line).context("decode worker report")
}

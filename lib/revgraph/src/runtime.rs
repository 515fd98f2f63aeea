//! The coordinator: runs the stages in order with a barrier between each.
//!
//! partition -> map (M workers) -> barrier -> region setup -> reduce (R workers)
//! -> barrier -> merge (OUT1) + summary emission (OUT2) -> cleanup.

use anyhow::{anyhow, Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ExecMode, PipelineConfig};
use crate::constants::ENV_WORKER_TASK;
use crate::error::StageError;
use crate::map::{run_mapper, MapTaskStats};
use crate::merge::merge_runs_to;
use crate::partition::split_edges;
use crate::reduce::{run_reducer, ReduceTaskStats};
use crate::region::ShuffleRegion;
use crate::stats::RunReport;
use crate::summary::emit_summary;
use crate::utils::{fd_soft_limit, local_run_id};
use crate::workspace::Workspace;
use crate::worker::{parse_report, WorkerReport, WorkerTask};

/// What a thread-mode reducer publishes about its span once it is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanPublication {
    pub reducer: usize,
    pub bytes_written: usize,
    pub entries: u64,
    pub skipped: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    worker_program: Option<PathBuf>,
}

impl Pipeline {
    /// Validates `config`; nothing is created on disk yet.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, worker_program: None })
    }

    /// Executable re-launched for each worker in process mode. Defaults to the
    /// current executable, which must call [`crate::worker::run_from_env`] first.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self) -> Result<RunReport> {
        let start = Instant::now();
        let c = &self.config;
        let run_id = local_run_id();
        let shm_dir = match c.mode {
            ExecMode::Process => c.shm_dir.as_deref(),
            ExecMode::Thread => None,
        };
        let mut ws = Workspace::create(&c.work_dir, &run_id, shm_dir, c.keep_intermediates)?;
        let mut report = RunReport::new(&run_id, c.mode, c.mappers, c.reducers, c.region_size());

        let fd_limit = fd_soft_limit();
        info!(
            run_id = %run_id, mode = ?c.mode, mappers = c.mappers, reducers = c.reducers,
            region_bytes = c.region_size(), fd_soft_limit = fd_limit.unwrap_or(0),
            "revgraph starting"
        );
        if let Some(limit) = fd_limit {
            let needed = (c.mappers * (c.reducers + 1) + c.reducers + 16) as u64;
            if c.mode == ExecMode::Thread && needed > limit {
                warn!(needed, limit, "open-file soft limit may be too low for this many carriers");
            }
        }

        let outcome = self.run_stages(&ws, &mut report);
        let cleaned = ws.cleanup();
        report.wall_ms = start.elapsed().as_millis() as u64;
        match (outcome, cleaned) {
            (Ok(()), Ok(())) => {
                info!(run_id = %run_id, wall_ms = report.wall_ms, "revgraph finished");
                Ok(report)
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(e), cleaned) => {
                if let Err(ce) = cleaned {
                    error!(error = ?ce, "cleanup after failure also failed");
                }
                Err(e)
            }
        }
    }

    fn run_stages(&self, ws: &Workspace, report: &mut RunReport) -> Result<()> {
        let c = &self.config;

        // Partition
        let partitions = ws.partition_paths(c.mappers);
        let part_stats = split_edges(&c.input, &partitions, &c.filter)?;
        info!(
            phase = "partition", lines_in = part_stats.lines_in, accepted = part_stats.accepted,
            filtered_out = part_stats.filtered_out, malformed = part_stats.malformed, wall_ms = part_stats.wall_ms,
            "Partition phase complete"
        );
        report.partition = Some(part_stats);

        // Map
        let map_start = Instant::now();
        let map_stats: Vec<MapTaskStats> = match c.mode {
            ExecMode::Thread => {
                let jobs: Vec<_> = (0..c.mappers)
                    .map(|m| {
                        let partition = ws.partition_path(m);
                        let buckets = ws.mapper_buckets(m, c.reducers);
                        let batch = c.local_batch_bytes;
                        move || run_mapper(m, &partition, &buckets, batch)
                    })
                    .collect();
                run_thread_stage("map", jobs)?
            }
            ExecMode::Process => {
                let tasks: Vec<WorkerTask> = (0..c.mappers)
                    .map(|m| WorkerTask::Map {
                        mapper: m,
                        partition: ws.partition_path(m),
                        buckets: ws.mapper_buckets(m, c.reducers),
                        batch_bytes: c.local_batch_bytes,
                    })
                    .collect();
                run_process_stage(&self.program()?, "map", &tasks)?
                    .into_iter()
                    .map(WorkerReport::into_map)
                    .collect::<Result<Vec<_>>>()?
            }
        };
        report.record_map(&map_stats, map_start.elapsed().as_millis() as u64);
        log_map(&map_stats, report);

        // Region: header written here, strictly before any reducer starts.
        let mut region = match c.mode {
            ExecMode::Thread => ShuffleRegion::create_anonymous(c.region_exponent, c.reducers)?,
            ExecMode::Process => ShuffleRegion::create_shared(ws.region_path(), c.region_exponent, c.reducers)?,
        };
        debug!(offsets = ?region.layout().offsets(), "shuffle region ready");

        // Reduce
        let reduce_start = Instant::now();
        let reduce_stats = match c.mode {
            ExecMode::Thread => {
                let published: Mutex<Vec<SpanPublication>> = Mutex::new(Vec::with_capacity(c.reducers));
                let stats = {
                    let published = &published;
                    let jobs: Vec<_> = region
                        .span_writers()
                        .into_iter()
                        .map(|mut span| {
                            let r = span.index();
                            let buckets = ws.reducer_buckets(r, c.mappers);
                            let run = ws.run_path(r);
                            move || {
                                let stats = run_reducer(r, &buckets, &run, &mut span)?;
                                published.lock().unwrap_or_else(PoisonError::into_inner).push(SpanPublication {
                                    reducer: r,
                                    bytes_written: span.bytes_written(),
                                    entries: span.entries(),
                                    skipped: span.skipped(),
                                });
                                Ok(stats)
                            }
                        })
                        .collect();
                    run_thread_stage("reduce", jobs)?
                };
                let published = published.into_inner().unwrap_or_else(PoisonError::into_inner);
                debug!(spans = ?published, "reducer spans published");
                stats
            }
            ExecMode::Process => {
                let tasks: Vec<WorkerTask> = (0..c.reducers)
                    .map(|r| WorkerTask::Reduce {
                        reducer: r,
                        reducers: c.reducers,
                        buckets: ws.reducer_buckets(r, c.mappers),
                        run: ws.run_path(r),
                        region: ws.region_path().to_path_buf(),
                    })
                    .collect();
                run_process_stage(&self.program()?, "reduce", &tasks)?
                    .into_iter()
                    .map(WorkerReport::into_reduce)
                    .collect::<Result<Vec<ReduceTaskStats>>>()?
            }
        };
        report.record_reduce(&reduce_stats, reduce_start.elapsed().as_millis() as u64);
        if let Some(agg) = &report.reduce {
            info!(
                phase = "reduce", reducers = agg.reducers, total_pairs = agg.total_pairs, total_groups = agg.total_groups,
                duplicates = agg.total_duplicates, missing_buckets = agg.missing_buckets,
                summary_entries = agg.summary_entries, summary_skipped = agg.summary_skipped,
                min_reducer_ms = agg.min_reducer_ms, max_reducer_ms = agg.max_reducer_ms,
                sort_threads = agg.max_sort_threads, wall_ms = agg.wall_ms,
                "Reduce phase complete"
            );
        }

        // Merge and summary both only read; run them side by side.
        let runs = ws.run_paths(c.reducers);
        let (merged, summarised) =
            rayon::join(|| merge_runs_to(&runs, &c.out_adjacency), || emit_summary(&region, &c.out_counts));
        let merge_stats = merged?;
        let summary_stats = summarised?;
        info!(
            phase = "merge", records = merge_stats.records, runs_absent = merge_stats.runs_absent,
            malformed = merge_stats.malformed, wall_ms = merge_stats.wall_ms, out = %c.out_adjacency.display(),
            "Merge phase complete"
        );
        info!(
            phase = "summary", entries = summary_stats.entries, spans_empty = summary_stats.spans_empty,
            malformed = summary_stats.malformed, wall_ms = summary_stats.wall_ms, out = %c.out_counts.display(),
            "Summary emission complete"
        );
        report.merge = Some(merge_stats);
        report.summary = Some(summary_stats);

        region.release()?;

        if let Some(msg) = report.discrepancy() {
            warn!("{}", msg);
        }
        Ok(())
    }

    fn program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(p) => Ok(p.clone()),
            None => std::env::current_exe().context("locate worker executable"),
        }
    }
}

fn log_map(per_task: &[MapTaskStats], report: &RunReport) {
    for t in per_task {
        debug!(mapper = t.mapper, edges = t.edges_in, per_bucket = ?t.per_bucket, wall_ms = t.wall_ms, "map task done");
    }
    if let Some(agg) = &report.map {
        info!(
            phase = "map", tasks = agg.tasks, total_edges = agg.total_edges, total_pairs = agg.total_pairs,
            malformed = agg.total_malformed, total_bytes_out = agg.total_bytes_out,
            min_task_ms = agg.min_task_ms, max_task_ms = agg.max_task_ms, wall_ms = agg.wall_ms,
            "Map phase complete"
        );
    }
}

/// Try `spawn`, and once more if it fails.
fn spawn_with_retry<T>(stage: &'static str, index: usize, mut spawn: impl FnMut() -> io::Result<T>) -> Result<T, StageError> {
    match spawn() {
        Ok(t) => Ok(t),
        Err(first) => {
            warn!(stage, worker = index, error = %first, "worker failed to start, retrying once");
            spawn().map_err(|source| StageError::Spawn { stage, index, source })
        }
    }
}

/// Run one thread per job and wait for all of them (the stage barrier).
/// Fails if any job could not be started, returned an error, or panicked.
pub fn run_thread_stage<T, F>(stage: &'static str, jobs: Vec<F>) -> Result<Vec<T>>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    // Jobs sit in slots so a failed spawn can be retried without losing the closure.
    let slots: Vec<Mutex<Option<F>>> = jobs.into_iter().map(|j| Mutex::new(Some(j))).collect();
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(slots.len());
        let mut spawn_error = None;
        for (index, slot) in slots.iter().enumerate() {
            let spawned = spawn_with_retry(stage, index, || {
                thread::Builder::new().name(worker_name(stage, index)).spawn_scoped(scope, move || {
                    let job = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                    match job {
                        Some(f) => f(),
                        None => Err(anyhow!("{} job {} already taken", stage, index)),
                    }
                })
            });
            match spawned {
                Ok(h) => handles.push((index, h)),
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        for (index, h) in handles {
            match h.join() {
                Ok(Ok(v)) => results.push(v),
                Ok(Err(e)) => failures.push(format!("{} worker {}: {:#}", stage, index, e)),
                Err(_) => failures.push(format!("{} worker {} panicked", stage, index)),
            }
        }
        if let Some(e) = spawn_error {
            return Err(e.into());
        }
        if !failures.is_empty() {
            for f in &failures {
                error!(stage, "{}", f);
            }
            return Err(StageError::WorkersFailed { stage, failures }.into());
        }
        Ok(results)
    })
}

fn worker_name(stage: &str, index: usize) -> String {
    match stage {
        "map" => format!("mapper-{}", index),
        "reduce" => format!("reducer-{}", index),
        other => format!("{}-{}", other, index),
    }
}

/// Run one child process per task and wait for all of them (the stage barrier).
pub fn run_process_stage(program: &Path, stage: &'static str, tasks: &[WorkerTask]) -> Result<Vec<WorkerReport>> {
    let mut children: Vec<(usize, Child)> = Vec::with_capacity(tasks.len());
    for task in tasks {
        let index = task.index();
        let payload = serde_json::to_string(task)?;
        let spawned = spawn_with_retry(stage, index, || {
            Command::new(program)
                .env(ENV_WORKER_TASK, &payload)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
        });
        match spawned {
            Ok(child) => {
                debug!(stage, worker = index, pid = child.id(), "worker started");
                children.push((index, child));
            }
            Err(e) => {
                for (i, mut child) in children {
                    if let Err(ke) = child.kill() {
                        warn!(stage, worker = i, error = %ke, "could not terminate worker");
                    }
                    let _ = child.wait();
                }
                return Err(e.into());
            }
        }
    }

    let mut reports = Vec::with_capacity(children.len());
    let mut failures = Vec::new();
    for (index, child) in children {
        let output = match child.wait_with_output() {
            Ok(o) => o,
            Err(e) => {
                failures.push(format!("{} worker {}: wait failed: {}", stage, index, e));
                continue;
            }
        };
        if !output.status.success() {
            failures.push(format!("{} worker {} {}", stage, index, describe_exit(output.status)));
            continue;
        }
        match parse_report(&output.stdout) {
            Ok(r) if r.stage() != stage => {
                failures.push(format!("{} worker {}: sent a {} report", stage, index, r.stage()));
            }
            Ok(r) => reports.push(r),
            Err(e) => failures.push(format!("{} worker {}: {:#}", stage, index, e)),
        }
    }
    if !failures.is_empty() {
        for f in &failures {
            error!(stage, "{}", f);
        }
        return Err(StageError::WorkersFailed { stage, failures }.into());
    }
    Ok(reports)
}

fn describe_exit(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("killed by signal {}", sig);
        }
    }
    match status.code() {
        Some(code) => format!("exited with status {}", code),
        None => "terminated abnormally".to_string(),
    }
}

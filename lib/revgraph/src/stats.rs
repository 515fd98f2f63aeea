use serde::{Deserialize, Serialize};

use crate::config::ExecMode;
use crate::map::MapTaskStats;
use crate::merge::MergeStats;
use crate::partition::PartitionStats;
use crate::reduce::ReduceTaskStats;
use crate::summary::SummaryStats;

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct MapStats {
    pub tasks: usize,
    pub total_edges: u64,
    pub total_pairs: u64,
    pub total_malformed: u64,
    pub total_bytes_out: u64,
    pub min_task_ms: u64,
    pub max_task_ms: u64,
    pub wall_ms: u64,
}

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct ReduceStatsAgg {
    pub reducers: usize,
    pub total_pairs: u64,
    pub total_groups: u64,
    pub total_duplicates: u64,
    pub missing_buckets: u64,
    pub summary_entries: u64,
    pub summary_skipped: u64,
    pub summary_bytes: u64,
    pub min_reducer_ms: u64,
    pub max_reducer_ms: u64,
    pub max_sort_threads: usize,
    pub wall_ms: u64,
}

/// Everything a run measured, serializable for `--stats-json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: ExecMode,
    pub mappers: usize,
    pub reducers: usize,
    pub region_bytes: usize,
    pub partition: Option<PartitionStats>,
    pub map: Option<MapStats>,
    pub reduce: Option<ReduceStatsAgg>,
    pub merge: Option<MergeStats>,
    pub summary: Option<SummaryStats>,
    pub wall_ms: u64,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, mode: ExecMode, mappers: usize, reducers: usize, region_bytes: usize) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            mappers,
            reducers,
            region_bytes,
            partition: None,
            map: None,
            reduce: None,
            merge: None,
            summary: None,
            wall_ms: 0,
        }
    }

    pub fn record_map(&mut self, per_task: &[MapTaskStats], wall_ms: u64) {
        if per_task.is_empty() { return; }
        self.map = Some(MapStats {
            tasks: per_task.len(),
            total_edges: per_task.iter().map(|t| t.edges_in).sum(),
            total_pairs: per_task.iter().map(|t| t.pairs_out).sum(),
            total_malformed: per_task.iter().map(|t| t.malformed).sum(),
            total_bytes_out: per_task.iter().map(|t| t.bytes_out).sum(),
            min_task_ms: per_task.iter().map(|t| t.wall_ms).min().unwrap_or(0),
            max_task_ms: per_task.iter().map(|t| t.wall_ms).max().unwrap_or(0),
            wall_ms,
        });
    }

    pub fn record_reduce(&mut self, per_reducer: &[ReduceTaskStats], wall_ms: u64) {
        if per_reducer.is_empty() { return; }
        self.reduce = Some(ReduceStatsAgg {
            reducers: per_reducer.len(),
            total_pairs: per_reducer.iter().map(|r| r.pairs_in).sum(),
            total_groups: per_reducer.iter().map(|r| r.groups).sum(),
            total_duplicates: per_reducer.iter().map(|r| r.duplicates).sum(),
            missing_buckets: per_reducer.iter().map(|r| r.buckets_missing).sum(),
            summary_entries: per_reducer.iter().map(|r| r.summary_entries).sum(),
            summary_skipped: per_reducer.iter().map(|r| r.summary_skipped).sum(),
            summary_bytes: per_reducer.iter().map(|r| r.summary_bytes).sum(),
            min_reducer_ms: per_reducer.iter().map(|r| r.wall_ms).min().unwrap_or(0),
            max_reducer_ms: per_reducer.iter().map(|r| r.wall_ms).max().unwrap_or(0),
            max_sort_threads: per_reducer.iter().map(|r| r.sort_threads).max().unwrap_or(0),
            wall_ms,
        });
    }

    /// Describe any disagreement between OUT1 records and OUT2 entries.
    pub fn discrepancy(&self) -> Option<String> {
        let records = self.merge.as_ref()?.records;
        let entries = self.summary.as_ref()?.entries;
        if records == entries {
            return None;
        }
        let skipped = self.reduce.as_ref().map_or(0, |r| r.summary_skipped);
        Some(format!(
            "OUT1 has {} records but OUT2 has {} entries ({} entries dropped by full shuffle region spans)",
            records, entries, skipped
        ))
    }
}

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::edge::{ReversedPair, Vertex};
use crate::io::{is_blank, lines, map_optional, open_writer, show_line};
use crate::region::SpanWriter;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReduceTaskStats {
    pub reducer: usize,
    pub buckets_read: u64,
    pub buckets_missing: u64,
    pub bytes_in: u64,
    pub pairs_in: u64,
    pub malformed: u64,
    pub groups: u64,
    pub duplicates: u64,
    pub summary_entries: u64,
    pub summary_skipped: u64,
    pub summary_bytes: u64,
    pub io_read_ms: u64,
    pub sort_ms: u64,
    /// Size of the rayon pool the sort ran on.
    pub sort_threads: usize,
    pub write_ms: u64,
    pub wall_ms: u64,
}

/// Gather every bucket addressed to this reducer, sort by (destination, source),
/// write one deduplicated record per destination to `run_path` and one
/// `"<destination> <count>\n"` entry per destination into `span`.
pub fn run_reducer(reducer: usize, buckets: &[PathBuf], run_path: &Path, span: &mut SpanWriter<'_>) -> Result<ReduceTaskStats> {
    let reducer_start = Instant::now();
    let mut stats = ReduceTaskStats { reducer, ..Default::default() };

    let read_start = Instant::now();
    let mut pairs: Vec<ReversedPair> = Vec::new();
    for path in buckets {
        let data = match map_optional(path).with_context(|| format!("reducer {} bucket", reducer))? {
            Some(d) => d,
            None => {
                debug!(reducer, bucket = %path.display(), "bucket absent, treating as empty");
                stats.buckets_missing += 1;
                continue;
            }
        };
        stats.buckets_read += 1;
        stats.bytes_in += data.as_bytes().len() as u64;
        for line in lines(data.as_bytes()) {
            match ReversedPair::parse(line) {
                Some(p) => pairs.push(p),
                None if is_blank(line) => {}
                None => {
                    stats.malformed += 1;
                    warn!(reducer, bucket = %path.display(), content = %show_line(line), "skipping malformed bucket line");
                }
            }
        }
    }
    stats.pairs_in = pairs.len() as u64;
    stats.io_read_ms = read_start.elapsed().as_millis() as u64;

    let sort_start = Instant::now();
    pairs.par_sort_unstable();
    stats.sort_threads = rayon::current_num_threads();
    stats.sort_ms = sort_start.elapsed().as_millis() as u64;

    let mut out = open_writer(run_path).with_context(|| format!("reducer {} run file", reducer))?;
    let mut write_time = Duration::ZERO;
    let mut line = Vec::with_capacity(256);
    let mut groups = 0u64;
    let duplicates = for_each_group(&pairs, |dest, sources| {
        let w_start = Instant::now();
        line.clear();
        write!(line, "{}:", dest)?;
        for s in sources {
            write!(line, " {}", s)?;
        }
        line.push(b'\n');
        out.write_all(&line).with_context(|| format!("write run {}", run_path.display()))?;
        write_time += w_start.elapsed();
        groups += 1;
        span.push_summary(dest, sources.len() as u64);
        Ok(())
    })?;
    out.flush().with_context(|| format!("flush run {}", run_path.display()))?;

    stats.groups = groups;
    stats.duplicates = duplicates;
    stats.write_ms = write_time.as_millis() as u64;
    stats.summary_entries = span.entries();
    stats.summary_skipped = span.skipped();
    stats.summary_bytes = span.bytes_written() as u64;
    stats.wall_ms = reducer_start.elapsed().as_millis() as u64;
    if stats.summary_skipped > 0 {
        warn!(reducer, skipped = stats.summary_skipped, "shuffle region span too small; OUT2 will be missing entries");
    }
    Ok(stats)
}

/// Sweep pairs sorted by (destination, source) once, calling `f` with each
/// destination and its strictly ascending, duplicate-free sources.
/// Returns the number of duplicate pairs dropped.
pub fn for_each_group<F>(pairs: &[ReversedPair], mut f: F) -> Result<u64>
where
    F: FnMut(Vertex, &[Vertex]) -> Result<()>,
{
    let mut duplicates = 0u64;
    let mut sources: Vec<Vertex> = Vec::new();
    let mut current: Option<Vertex> = None;
    for p in pairs {
        match current {
            Some(d) if d == p.dest => {
                if sources.last() != Some(&p.source) {
                    sources.push(p.source);
                } else {
                    duplicates += 1;
                }
            }
            Some(d) => {
                f(d, &sources)?;
                sources.clear();
                sources.push(p.source);
                current = Some(p.dest);
            }
            None => {
                sources.push(p.source);
                current = Some(p.dest);
            }
        }
    }
    if let Some(d) = current {
        f(d, &sources)?;
    }
    Ok(duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::ShuffleRegion;
    use std::fs;

    fn rp(dest: u64, source: u64) -> ReversedPair {
        ReversedPair { dest, source }
    }

    #[test]
    fn groups_and_dedupes_sorted_pairs() {
        let pairs = vec![rp(1, 0), rp(3, 1), rp(3, 1), rp(3, 2), rp(5, 5)];
        let mut seen = Vec::new();
        let dups = for_each_group(&pairs, |d, s| {
            seen.push((d, s.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(dups, 1);
        assert_eq!(seen, vec![(1, vec![0]), (3, vec![1, 2]), (5, vec![5])]);
    }

    #[test]
    fn no_pairs_no_groups() {
        let mut calls = 0;
        for_each_group(&[], |_, _| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn reducer_merges_buckets_and_tolerates_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let b0 = dir.path().join("task0_part1.txt");
        let b1 = dir.path().join("task1_part1.txt");
        let absent = dir.path().join("task2_part1.txt");
        fs::write(&b0, "4 3\n1 0\n4 2\n").unwrap();
        fs::write(&b1, "1 0\nnot a pair\n7 9\n").unwrap();
        let run = dir.path().join("part-00001.txt");

        let mut region = ShuffleRegion::create_anonymous(10, 3).unwrap();
        let stats = {
            let mut span = region.span_writer(1).unwrap();
            run_reducer(1, &[b0, b1, absent], &run, &mut span).unwrap()
        };

        assert_eq!(stats.buckets_read, 2);
        assert_eq!(stats.buckets_missing, 1);
        assert_eq!(stats.pairs_in, 5);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.groups, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(fs::read_to_string(&run).unwrap(), "1: 0\n4: 2 3\n7: 9\n");
        assert!(region.span(1).unwrap().starts_with(b"1 1\n4 2\n7 1\n\0"));
        assert!(region.span(0).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn reducer_with_no_input_writes_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("part-00000.txt");
        let mut region = ShuffleRegion::create_anonymous(8, 1).unwrap();
        let mut span = region.span_writer(0).unwrap();
        let stats = run_reducer(0, &[dir.path().join("missing")], &run, &mut span).unwrap();
        assert_eq!(stats.groups, 0);
        assert_eq!(fs::read_to_string(&run).unwrap(), "");
    }
}

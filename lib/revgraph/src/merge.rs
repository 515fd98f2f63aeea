//! R-way merge of the per-reducer runs into OUT1.
//!
//! Runs are disjoint by destination (each destination belongs to exactly one
//! reducer), so the merge only orders records; equal heads across runs mean
//! the routing invariant was broken and fail the merge.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

use crate::edge::Vertex;
use crate::io::write_atomically;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub runs_present: u64,
    pub runs_absent: u64,
    pub records: u64,
    pub malformed: u64,
    pub bytes_out: u64,
    pub wall_ms: u64,
}

struct RunCursor {
    path: PathBuf,
    reader: BufReader<File>,
    line: String,
    dest: Vertex,
    last: Option<Vertex>,
}

impl RunCursor {
    /// `Ok(None)` when the run does not exist.
    fn open(path: &Path) -> Result<Option<Self>> {
        match File::open(path) {
            Ok(f) => Ok(Some(Self { path: path.to_path_buf(), reader: BufReader::new(f), line: String::new(), dest: 0, last: None })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("open run {}", path.display())),
        }
    }

    /// Load the next well-formed record. Returns `false` once the run is exhausted.
    fn advance(&mut self, stats: &mut MergeStats) -> Result<bool> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).with_context(|| format!("read run {}", self.path.display()))?;
            if n == 0 {
                return Ok(false);
            }
            let trimmed_len = self.line.trim_end_matches(&['\n', '\r'][..]).len();
            self.line.truncate(trimmed_len);
            if self.line.trim().is_empty() {
                continue;
            }
            let dest = match record_dest(&self.line) {
                Some(d) => d,
                None => {
                    stats.malformed += 1;
                    warn!(run = %self.path.display(), content = %self.line, "skipping malformed run record");
                    continue;
                }
            };
            if let Some(prev) = self.last {
                if dest <= prev {
                    bail!("run {} is not strictly ascending: {} follows {}", self.path.display(), dest, prev);
                }
            }
            self.last = Some(dest);
            self.dest = dest;
            return Ok(true);
        }
    }
}

/// Destination of a `"<destination>: <sources...>"` record.
fn record_dest(line: &str) -> Option<Vertex> {
    let (dest, _) = line.split_once(':')?;
    dest.trim().parse().ok()
}

/// Merge `runs` into `out` in strictly ascending destination order. Absent runs
/// count as empty.
pub fn merge_runs<W: Write + ?Sized>(runs: &[PathBuf], out: &mut W) -> Result<MergeStats> {
    let start = Instant::now();
    let mut stats = MergeStats::default();
    let mut cursors: Vec<RunCursor> = Vec::with_capacity(runs.len());
    let mut heap: BinaryHeap<Reverse<(Vertex, usize)>> = BinaryHeap::with_capacity(runs.len());

    for path in runs {
        match RunCursor::open(path)? {
            Some(mut c) => {
                stats.runs_present += 1;
                if c.advance(&mut stats)? {
                    heap.push(Reverse((c.dest, cursors.len())));
                }
                cursors.push(c);
            }
            None => {
                debug!(run = %path.display(), "run absent, treating as empty");
                stats.runs_absent += 1;
            }
        }
    }

    let mut last: Option<Vertex> = None;
    while let Some(Reverse((dest, idx))) = heap.pop() {
        if let Some(prev) = last {
            if dest <= prev {
                bail!("destination {} appears in more than one run (after {})", dest, prev);
            }
        }
        last = Some(dest);
        let cursor = &mut cursors[idx];
        out.write_all(cursor.line.as_bytes())?;
        out.write_all(b"\n")?;
        stats.records += 1;
        stats.bytes_out += cursor.line.len() as u64 + 1;
        if cursor.advance(&mut stats)? {
            heap.push(Reverse((cursor.dest, idx)));
        }
    }

    stats.wall_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}

/// Merge `runs` into the file at `out_path`, replacing it only once complete.
pub fn merge_runs_to(runs: &[PathBuf], out_path: &Path) -> Result<MergeStats> {
    let mut stats = MergeStats::default();
    write_atomically(out_path, |w| {
        stats = merge_runs(runs, w)?;
        Ok(())
    })
    .with_context(|| format!("write {}", out_path.display()))?;
    Ok(stats)
}

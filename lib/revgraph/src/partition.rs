//! Splits the input edge list into per-mapper partition carriers.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::DestFilter;
use crate::edge::Edge;
use crate::io::{is_blank, lines, map_required, open_writer, show_line};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartitionStats {
    pub lines_in: u64,
    pub accepted: u64,
    pub filtered_out: u64,
    pub malformed: u64,
    pub per_partition: Vec<u64>,
    pub wall_ms: u64,
}

/// Round-robin the accepted edges of `input` over `outputs`: the i-th accepted
/// edge lands in partition `i mod outputs.len()`, keeping input order within
/// each partition. Every output is created, possibly empty.
pub fn split_edges(input: &Path, outputs: &[PathBuf], filter: &DestFilter) -> Result<PartitionStats> {
    let start = Instant::now();
    let parts = outputs.len();
    anyhow::ensure!(parts > 0, "no partitions requested");

    let mut writers = outputs.iter().map(open_writer).collect::<Result<Vec<_>>>()?;
    let data = map_required(input)?;

    let mut stats = PartitionStats { per_partition: vec![0; parts], ..Default::default() };
    let mut next = 0usize;
    for (lineno, line) in lines(data.as_bytes()).enumerate() {
        stats.lines_in += 1;
        let edge = match Edge::parse(line) {
            Some(e) => e,
            None => {
                if !is_blank(line) {
                    stats.malformed += 1;
                    warn!(line = lineno + 1, content = %show_line(line), "skipping malformed input line");
                }
                continue;
            }
        };
        if !filter.accepts(edge.dest) {
            stats.filtered_out += 1;
            continue;
        }
        edge.write_to(&mut writers[next])
            .with_context(|| format!("write partition {}", outputs[next].display()))?;
        stats.per_partition[next] += 1;
        stats.accepted += 1;
        next = (next + 1) % parts;
    }

    for (w, path) in writers.iter_mut().zip(outputs) {
        w.flush().with_context(|| format!("flush partition {}", path.display()))?;
    }
    stats.wall_ms = start.elapsed().as_millis() as u64;
    debug!(input = %input.display(), partitions = parts, accepted = stats.accepted, "input split");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup(input: &str, parts: usize) -> (tempfile::TempDir, PathBuf, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        fs::write(&path, input).unwrap();
        let outs = (0..parts).map(|i| dir.path().join(format!("split/part-{}.txt", i))).collect();
        (dir, path, outs)
    }

    #[test]
    fn round_robin_preserves_order() {
        let (_dir, input, outs) = setup("0 1\n1 2\n2 3\n3 4\n4 5\n", 2);
        let stats = split_edges(&input, &outs, &DestFilter::default()).unwrap();
        assert_eq!(stats.accepted, 5);
        assert_eq!(stats.per_partition, vec![3, 2]);
        assert_eq!(fs::read_to_string(&outs[0]).unwrap(), "0 1\n2 3\n4 5\n");
        assert_eq!(fs::read_to_string(&outs[1]).unwrap(), "1 2\n3 4\n");
    }

    #[test]
    fn malformed_and_filtered_lines_do_not_advance_round_robin() {
        let (_dir, input, outs) = setup("0 1\ngarbage\n\n1 9\n2 3\n5 2\n", 2);
        let filter = DestFilter::from_bounds(-1, 3).unwrap();
        let stats = split_edges(&input, &outs, &filter).unwrap();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.filtered_out, 1);
        assert_eq!(fs::read_to_string(&outs[0]).unwrap(), "0 1\n5 2\n");
        assert_eq!(fs::read_to_string(&outs[1]).unwrap(), "2 3\n");
    }

    #[test]
    fn every_partition_is_created() {
        let (_dir, input, outs) = setup("0 1\n", 4);
        split_edges(&input, &outs, &DestFilter::default()).unwrap();
        for p in &outs {
            assert!(p.exists(), "{} missing", p.display());
        }
        assert_eq!(fs::read_to_string(&outs[3]).unwrap(), "");
    }

    #[test]
    fn normalises_whitespace() {
        let (_dir, input, outs) = setup("  7\t8  \r\n", 1);
        split_edges(&input, &outs, &DestFilter::default()).unwrap();
        assert_eq!(fs::read_to_string(&outs[0]).unwrap(), "7 8\n");
    }
}

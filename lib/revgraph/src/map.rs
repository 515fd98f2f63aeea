use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

use crate::edge::{reducer_for, Edge};
use crate::io::{is_blank, lines, map_required, open_writer, show_line};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MapTaskStats {
    pub mapper: usize,
    pub edges_in: u64,
    pub malformed: u64,
    pub pairs_out: u64,
    pub per_bucket: Vec<u64>,
    pub bytes_out: u64,
    pub flushes: u64,
    pub wall_ms: u64,
}

/// Reverse every edge of one partition and route it to bucket `dest mod R`,
/// where R = `buckets.len()`. All R bucket carriers are created even when
/// they stay empty.
pub fn run_mapper(mapper: usize, partition: &Path, buckets: &[PathBuf], batch_bytes: usize) -> Result<MapTaskStats> {
    let task_start = Instant::now();
    let reducers = buckets.len();
    anyhow::ensure!(reducers > 0, "mapper {} has no buckets", mapper);

    let data = map_required(partition).with_context(|| format!("mapper {} partition", mapper))?;
    let mut writers: Vec<BufWriter<File>> = buckets.iter().map(open_writer).collect::<Result<_>>()?;
    debug!(mapper, partition = %partition.display(), buckets = reducers, "map task starting");

    let mut stats = MapTaskStats { mapper, per_bucket: vec![0; reducers], ..Default::default() };
    let mut local_buffers: Vec<Vec<u8>> = (0..reducers).map(|_| Vec::with_capacity(batch_bytes.min(64 * 1024))).collect();

    let flush_part = |part: usize, buffers: &mut [Vec<u8>], writers: &mut [BufWriter<File>], stats: &mut MapTaskStats| -> Result<()> {
        if !buffers[part].is_empty() {
            writers[part]
                .write_all(&buffers[part])
                .with_context(|| format!("write bucket {}", buckets[part].display()))?;
            stats.bytes_out += buffers[part].len() as u64;
            stats.flushes += 1;
            buffers[part].clear();
        }
        Ok(())
    };

    for (lineno, line) in lines(data.as_bytes()).enumerate() {
        let edge = match Edge::parse(line) {
            Some(e) => e,
            None => {
                if !is_blank(line) {
                    stats.malformed += 1;
                    warn!(mapper, line = lineno + 1, content = %show_line(line), "skipping malformed partition line");
                }
                continue;
            }
        };
        stats.edges_in += 1;
        let part = reducer_for(edge.dest, reducers);
        let buf = &mut local_buffers[part];
        edge.reversed().write_to(buf)?;
        stats.per_bucket[part] += 1;
        stats.pairs_out += 1;
        if buf.len() >= batch_bytes {
            flush_part(part, &mut local_buffers, &mut writers, &mut stats)?;
        }
    }

    for part in 0..reducers {
        flush_part(part, &mut local_buffers, &mut writers, &mut stats)?;
    }
    for (w, path) in writers.iter_mut().zip(buckets) {
        w.flush().with_context(|| format!("flush bucket {}", path.display()))?;
    }
    stats.wall_ms = task_start.elapsed().as_millis() as u64;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn routes_reversed_pairs_by_destination() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("part-0.txt");
        fs::write(&part, "0 1\n1 2\n2 3\n3 4\n1 3\n").unwrap();
        let buckets: Vec<PathBuf> = (0..3).map(|r| dir.path().join(format!("task0_part{}.txt", r))).collect();

        let stats = run_mapper(0, &part, &buckets, 8).unwrap();
        assert_eq!(stats.edges_in, 5);
        assert_eq!(stats.per_bucket, vec![2, 2, 1]);

        assert_eq!(fs::read_to_string(&buckets[0]).unwrap(), "3 2\n3 1\n");
        assert_eq!(fs::read_to_string(&buckets[1]).unwrap(), "1 0\n4 3\n");
        assert_eq!(fs::read_to_string(&buckets[2]).unwrap(), "2 1\n");
        let b1 = fs::read_to_string(&buckets[1]).unwrap();
        assert!(b1.lines().all(|l| l.split(' ').next().unwrap().parse::<u64>().unwrap() % 3 == 1));
    }

    #[test]
    fn empty_partition_still_creates_every_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("part-0.txt");
        fs::write(&part, "").unwrap();
        let buckets: Vec<PathBuf> = (0..4).map(|r| dir.path().join(format!("b{}", r))).collect();
        let stats = run_mapper(0, &part, &buckets, 1024).unwrap();
        assert_eq!(stats.pairs_out, 0);
        assert!(buckets.iter().all(|b| b.exists()));
    }

    #[test]
    fn missing_partition_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let buckets = vec![dir.path().join("b0")];
        assert!(run_mapper(0, &dir.path().join("nope"), &buckets, 1024).is_err());
    }
}

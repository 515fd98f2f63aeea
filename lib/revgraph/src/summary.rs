use anyhow::{Context, Result};
use memchr::memchr;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::warn;

use crate::edge::Vertex;
use crate::io::{is_blank, lines, parse_u64_pair, show_line, write_atomically};
use crate::region::ShuffleRegion;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub dest: Vertex,
    pub count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SummaryStats {
    pub spans_empty: u64,
    pub entries: u64,
    pub malformed: u64,
    pub wall_ms: u64,
}

/// Written prefix of a span: everything before the first zero byte.
pub fn span_content(span: &[u8]) -> &[u8] {
    match memchr(0, span) {
        Some(end) => &span[..end],
        None => span,
    }
}

/// Parse every span of the region, in reducer order, and return the entries
/// sorted by destination.
pub fn collect_summaries(region: &ShuffleRegion) -> Result<(Vec<SummaryEntry>, SummaryStats)> {
    let mut stats = SummaryStats::default();
    let mut entries = Vec::new();
    for reducer in 0..region.reducers() {
        let content = span_content(region.span(reducer)?);
        if content.is_empty() {
            stats.spans_empty += 1;
            continue;
        }
        for line in lines(content) {
            match parse_u64_pair(line) {
                Some((dest, count)) => entries.push(SummaryEntry { dest, count }),
                None if is_blank(line) => {}
                None => {
                    stats.malformed += 1;
                    warn!(reducer, content = %show_line(line), "skipping malformed region entry");
                }
            }
        }
    }
    entries.sort_unstable_by_key(|e| e.dest);
    stats.entries = entries.len() as u64;
    Ok((entries, stats))
}

pub fn write_summaries<W: Write + ?Sized>(entries: &[SummaryEntry], out: &mut W) -> Result<()> {
    for e in entries {
        writeln!(out, "{} {}", e.dest, e.count)?;
    }
    Ok(())
}

/// Write OUT2 from the region's spans.
pub fn emit_summary(region: &ShuffleRegion, out_path: &Path) -> Result<SummaryStats> {
    let start = Instant::now();
    let (entries, mut stats) = collect_summaries(region)?;
    write_atomically(out_path, |w| write_summaries(&entries, w)).with_context(|| format!("write {}", out_path.display()))?;
    stats.wall_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_stops_at_first_zero() {
        assert_eq!(span_content(b"1 2\n3 4\n\0\0\0"), b"1 2\n3 4\n");
        assert_eq!(span_content(b"\0\0"), b"");
        assert_eq!(span_content(b"9 9\n"), b"9 9\n");
    }

    #[test]
    fn entries_are_sorted_across_spans() {
        let mut region = ShuffleRegion::create_anonymous(10, 3).unwrap();
        {
            let mut w = region.span_writers();
            w[0].push_summary(3, 2);
            w[1].push_summary(1, 1);
            w[1].push_summary(4, 2);
            w[2].push_summary(2, 2);
            w[2].push_summary(5, 2);
        }
        let (entries, stats) = collect_summaries(&region).unwrap();
        let dests: Vec<u64> = entries.iter().map(|e| e.dest).collect();
        assert_eq!(dests, vec![1, 2, 3, 4, 5]);
        assert_eq!(stats.spans_empty, 0);

        let mut out = Vec::new();
        write_summaries(&entries, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1 1\n2 2\n3 2\n4 2\n5 2\n");
    }

    #[test]
    fn empty_spans_are_silent() {
        let region = ShuffleRegion::create_anonymous(8, 2).unwrap();
        let (entries, stats) = collect_summaries(&region).unwrap();
        assert!(entries.is_empty());
        assert_eq!(stats.spans_empty, 2);
        assert_eq!(stats.malformed, 0);
    }

    #[test]
    fn emit_writes_out2() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = ShuffleRegion::create_anonymous(8, 1).unwrap();
        region.span_writer(0).unwrap().push_summary(0, 3);
        let out = dir.path().join("out2.txt");
        let stats = emit_summary(&region, &out).unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "0 3\n");
    }
}

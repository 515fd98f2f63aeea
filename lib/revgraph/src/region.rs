//! The Shuffle Region: a byte region shared by the reducers.
//!
//! Layout: `[reducer count: u32 LE][R + 1 offsets: u64 LE][R data spans]`.
//! Span `i` is `[offset[i], offset[i + 1])` and receives ASCII lines
//! `"<destination> <count>\n"` from reducer `i` only. Unwritten bytes stay zero,
//! so the first zero byte of a span terminates its content.
//!
//! Writers never get the whole region: [`ShuffleRegion::span_writers`] splits the
//! data area into disjoint `&mut [u8]` spans, and a worker process attaching to a
//! shared region only ever asks for its own span.

use anyhow::{Context, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::RegionError;

const COUNT_BYTES: usize = 4;
const OFFSET_BYTES: usize = 8;
/// Longest possible entry: two 20-digit numbers, a space and a newline.
const MAX_ENTRY_BYTES: usize = 42;

pub fn header_size(reducers: usize) -> usize {
    COUNT_BYTES + OFFSET_BYTES * (reducers + 1)
}

/// Decoded header: reducer count and offset table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    reducers: usize,
    offsets: Vec<usize>,
}

impl RegionLayout {
    /// Equal spans over the post-header bytes of a `total`-byte region.
    pub fn new(total: usize, reducers: usize) -> Result<Self, RegionError> {
        let header = header_size(reducers);
        if reducers == 0 {
            return Err(RegionError::Offsets("zero reducers".into()));
        }
        if total < header {
            return Err(RegionError::TooSmall { len: total, header });
        }
        let span = (total - header) / reducers;
        let offsets = (0..=reducers).map(|i| header + i * span).collect();
        Ok(Self { reducers, offsets })
    }

    pub fn reducers(&self) -> usize {
        self.reducers
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn header_size(&self) -> usize {
        header_size(self.reducers)
    }

    pub fn span_of(&self, index: usize) -> Result<Range<usize>, RegionError> {
        if index >= self.reducers {
            return Err(RegionError::NoSuchSpan { index, reducers: self.reducers });
        }
        Ok(self.offsets[index]..self.offsets[index + 1])
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[..COUNT_BYTES].copy_from_slice(&(self.reducers as u32).to_le_bytes());
        for (i, off) in self.offsets.iter().enumerate() {
            let at = COUNT_BYTES + i * OFFSET_BYTES;
            dst[at..at + OFFSET_BYTES].copy_from_slice(&(*off as u64).to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        if bytes.len() < COUNT_BYTES {
            return Err(RegionError::TooSmall { len: bytes.len(), header: COUNT_BYTES });
        }
        let mut count = [0u8; COUNT_BYTES];
        count.copy_from_slice(&bytes[..COUNT_BYTES]);
        let reducers = u32::from_le_bytes(count) as usize;
        if reducers == 0 {
            return Err(RegionError::Offsets("zero reducers".into()));
        }
        let header = header_size(reducers);
        if bytes.len() < header {
            return Err(RegionError::TooSmall { len: bytes.len(), header });
        }
        let offsets: Vec<usize> = (0..=reducers)
            .map(|i| {
                let at = COUNT_BYTES + i * OFFSET_BYTES;
                let mut raw = [0u8; OFFSET_BYTES];
                raw.copy_from_slice(&bytes[at..at + OFFSET_BYTES]);
                u64::from_le_bytes(raw) as usize
            })
            .collect();
        if offsets[0] != header {
            return Err(RegionError::Offsets(format!("first offset {} != header size {}", offsets[0], header)));
        }
        if offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(RegionError::Offsets("offsets are not monotonic".into()));
        }
        if offsets[reducers] > bytes.len() {
            return Err(RegionError::Offsets(format!("last offset {} beyond region end {}", offsets[reducers], bytes.len())));
        }
        Ok(Self { reducers, offsets })
    }
}

enum Backing {
    /// In-process buffer (thread mode).
    Anonymous,
    /// Shared file created by this process; removed on release.
    Owned(PathBuf),
    /// Shared file created by someone else (worker side).
    Attached,
}

pub struct ShuffleRegion {
    map: MmapMut,
    layout: RegionLayout,
    backing: Backing,
}

impl ShuffleRegion {
    /// Zero-filled in-process region of `2^exponent` bytes with its header written.
    pub fn create_anonymous(exponent: u32, reducers: usize) -> Result<Self> {
        let len = region_len(exponent)?;
        let layout = RegionLayout::new(len, reducers)?;
        let map = MmapOptions::new().len(len).map_anon().with_context(|| format!("allocate {}-byte shuffle region", len))?;
        Ok(Self::initialise(map, layout, Backing::Anonymous))
    }

    /// Zero-filled region of `2^exponent` bytes backed by a new file at `path`,
    /// mapped shared so worker processes attaching to the same file see one region.
    pub fn create_shared(path: &Path, exponent: u32, reducers: usize) -> Result<Self> {
        let len = region_len(exponent)?;
        let layout = RegionLayout::new(len, reducers)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("create shuffle region {}", path.display()))?;
        let mapped = file
            .set_len(len as u64)
            .with_context(|| format!("size shuffle region {} to {} bytes", path.display(), len))
            // SAFETY: the file was just created with create_new; only workers of this run map it.
            .and_then(|_| unsafe { MmapMut::map_mut(&file) }.with_context(|| format!("mmap shuffle region {}", path.display())));
        let map = match mapped {
            Ok(m) => m,
            Err(e) => {
                let _ = fs::remove_file(path);
                return Err(e);
            }
        };
        let region = Self::initialise(map, layout, Backing::Owned(path.to_path_buf()));
        debug!(path = %path.display(), len, reducers, "shared shuffle region created");
        Ok(region)
    }

    /// Map an existing shared region and validate its header.
    pub fn attach(path: &Path, expected_reducers: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open shuffle region {}", path.display()))?;
        // SAFETY: the coordinator keeps the file alive and sized for the whole reduce stage.
        let map = unsafe { MmapMut::map_mut(&file) }.with_context(|| format!("mmap shuffle region {}", path.display()))?;
        let layout = RegionLayout::decode(&map[..]).with_context(|| format!("bad header in {}", path.display()))?;
        if layout.reducers() != expected_reducers {
            return Err(RegionError::ReducerCount { found: layout.reducers(), expected: expected_reducers }.into());
        }
        Ok(Self { map, layout, backing: Backing::Attached })
    }

    fn initialise(mut map: MmapMut, layout: RegionLayout, backing: Backing) -> Self {
        layout.encode(&mut map[..]);
        Self { map, layout, backing }
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn reducers(&self) -> usize {
        self.layout.reducers()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Owned(p) => Some(p),
            _ => None,
        }
    }

    pub fn span_of(&self, index: usize) -> Result<Range<usize>, RegionError> {
        self.layout.span_of(index)
    }

    /// Raw bytes of span `index`, including its zero padding.
    pub fn span(&self, index: usize) -> Result<&[u8], RegionError> {
        let range = self.span_of(index)?;
        Ok(&self.map[range])
    }

    /// Write capability over span `index` only.
    pub fn span_writer(&mut self, index: usize) -> Result<SpanWriter<'_>, RegionError> {
        let range = self.span_of(index)?;
        Ok(SpanWriter::new(index, &mut self.map[range]))
    }

    /// One writer per span; the borrows are disjoint so each can move to its own worker.
    pub fn span_writers(&mut self) -> Vec<SpanWriter<'_>> {
        let offsets = self.layout.offsets().to_vec();
        let (_, mut rest) = self.map.split_at_mut(offsets[0]);
        let mut writers = Vec::with_capacity(offsets.len() - 1);
        for (index, w) in offsets.windows(2).enumerate() {
            let (span, tail) = std::mem::take(&mut rest).split_at_mut(w[1] - w[0]);
            writers.push(SpanWriter::new(index, span));
            rest = tail;
        }
        writers
    }

    pub fn flush(&self) -> Result<()> {
        if matches!(self.backing, Backing::Anonymous) {
            return Ok(());
        }
        self.map.flush().context("flush shuffle region")
    }

    /// Unmap the region and remove its backing file, if this process created one.
    pub fn release(mut self) -> Result<()> {
        let backing = std::mem::replace(&mut self.backing, Backing::Anonymous);
        drop(self);
        if let Backing::Owned(path) = backing {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "shuffle region released"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("remove shuffle region {}", path.display())),
            }
        }
        Ok(())
    }
}

impl Drop for ShuffleRegion {
    fn drop(&mut self) {
        if let Backing::Owned(path) = &self.backing {
            let _ = fs::remove_file(path);
        }
    }
}

fn region_len(exponent: u32) -> Result<usize> {
    1usize
        .checked_shl(exponent)
        .with_context(|| format!("2^{} bytes does not fit in memory", exponent))
}

/// Append-only writer over one reducer's span.
pub struct SpanWriter<'a> {
    index: usize,
    buf: &'a mut [u8],
    cursor: usize,
    entries: u64,
    skipped: u64,
}

impl<'a> SpanWriter<'a> {
    fn new(index: usize, buf: &'a mut [u8]) -> Self {
        Self { index, buf, cursor: 0, entries: 0, skipped: 0 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Append `"<dest> <count>\n"`. An entry that does not fit is skipped with a
    /// warning and `false` is returned; the span is left untouched.
    pub fn push_summary(&mut self, dest: u64, count: u64) -> bool {
        let mut line = [0u8; MAX_ENTRY_BYTES];
        let len = {
            let mut w = &mut line[..];
            // Cannot fail: MAX_ENTRY_BYTES covers the widest u64 pair.
            let _ = writeln!(w, "{} {}", dest, count);
            MAX_ENTRY_BYTES - w.len()
        };
        if self.cursor + len > self.buf.len() {
            self.skipped += 1;
            warn!(
                reducer = self.index,
                dest,
                count,
                span_bytes = self.buf.len(),
                used = self.cursor,
                "shuffle region span full, summary entry dropped"
            );
            return false;
        }
        self.buf[self.cursor..self.cursor + len].copy_from_slice(&line[..len]);
        self.cursor += len;
        self.entries += 1;
        true
    }

    pub fn bytes_written(&self) -> usize {
        self.cursor
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

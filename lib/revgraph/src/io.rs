use anyhow::{Context, Result};
use memchr::memchr;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::constants::OUTPUT_BUF_BYTES;

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref()).with_context(|| format!("create_dir_all {}", path.as_ref().display()))
}

pub fn open_writer(path: impl AsRef<Path>) -> Result<BufWriter<File>> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let file = File::create(path.as_ref()).with_context(|| format!("create {}", path.as_ref().display()))?;
    Ok(BufWriter::with_capacity(OUTPUT_BUF_BYTES, file))
}

/// Read-only view of a whole file. Empty files are not mapped.
pub enum FileBytes {
    Mapped(Mmap),
    Empty,
}

impl FileBytes {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(m) => &m[..],
            FileBytes::Empty => &[],
        }
    }
}

/// Map `path` read-only. Returns `Ok(None)` when the file does not exist;
/// every other failure is an error.
pub fn map_optional(path: impl AsRef<Path>) -> Result<Option<FileBytes>> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let len = file.metadata().with_context(|| format!("stat {}", path.display()))?.len();
    if len == 0 {
        return Ok(Some(FileBytes::Empty));
    }
    // SAFETY: the pipeline never truncates or rewrites a carrier while a later stage reads it.
    let map = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", path.display()))?;
    Ok(Some(FileBytes::Mapped(map)))
}

/// Map `path` read-only; a missing file is an error.
pub fn map_required(path: impl AsRef<Path>) -> Result<FileBytes> {
    let path = path.as_ref();
    map_optional(path)?.with_context(|| format!("{} does not exist", path.display()))
}

/// Iterator over the lines of a byte buffer, without their `\n` (and `\r`).
pub struct Lines<'a> {
    bytes: &'a [u8],
    off: usize,
}

pub fn lines(bytes: &[u8]) -> Lines<'_> {
    Lines { bytes, off: 0 }
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.off >= self.bytes.len() {
            return None;
        }
        let rest = &self.bytes[self.off..];
        let (mut line, adv) = match memchr(b'\n', rest) {
            Some(i) => (&rest[..i], i + 1),
            None => (rest, rest.len()),
        };
        self.off += adv;
        if let [head @ .., b'\r'] = line {
            line = head;
        }
        Some(line)
    }
}

/// Parse a line holding exactly two whitespace-separated non-negative integers.
pub fn parse_u64_pair(line: &[u8]) -> Option<(u64, u64)> {
    let text = std::str::from_utf8(line).ok()?;
    let mut it = text.split_ascii_whitespace();
    let a = it.next()?.parse::<u64>().ok()?;
    let b = it.next()?.parse::<u64>().ok()?;
    if it.next().is_some() {
        return None;
    }
    Some((a, b))
}

pub fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

/// Lossy rendering of a raw line for diagnostics, truncated.
pub fn show_line(line: &[u8]) -> String {
    const MAX: usize = 80;
    let s = String::from_utf8_lossy(&line[..line.len().min(MAX)]);
    if line.len() > MAX { format!("{}...", s) } else { s.into_owned() }
}

/// Write `fill` into a temporary sibling of `path` and rename it into place
/// once it is complete, so a failed run never leaves a half-written output.
pub fn write_atomically<F>(path: impl AsRef<Path>, fill: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    ensure_dir(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".revgraph-out-")
        .tempfile_in(dir)
        .with_context(|| format!("create temporary output in {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(0o644))?;
    }
    {
        let mut w = BufWriter::with_capacity(OUTPUT_BUF_BYTES, tmp.as_file_mut());
        fill(&mut w)?;
        w.flush().with_context(|| format!("flush output for {}", path.display()))?;
    }
    tmp.persist(path).map_err(|e| e.error).with_context(|| format!("rename output into {}", path.display()))?;
    Ok(())
}

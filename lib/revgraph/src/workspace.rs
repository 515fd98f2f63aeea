//! Per-run scratch space and its cleanup.

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::constants::RUNS_DIR;
use crate::io::ensure_dir;

/// Owns every transient artifact of one run: partition carriers, bucket
/// carriers, reducer runs and the region backing file. Cleanup runs on
/// [`Workspace::cleanup`] or, failing that, on drop.
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    runs_root: PathBuf,
    root: PathBuf,
    region_path: PathBuf,
    keep_intermediates: bool,
    cleaned: bool,
}

impl Workspace {
    pub fn create(work_dir: &Path, run_id: &str, shm_dir: Option<&Path>, keep_intermediates: bool) -> Result<Self> {
        let runs_root = work_dir.join(RUNS_DIR);
        let root = runs_root.join(run_id);
        if root.exists() {
            anyhow::bail!("run directory {} already exists", root.display());
        }
        for sub in ["split", "map_out", "reduce_out"] {
            ensure_dir(root.join(sub))?;
        }
        let region_dir = shm_dir.map(Path::to_path_buf).unwrap_or_else(|| root.clone());
        let region_path = region_dir.join(format!("revgraph-{}.region", run_id));
        debug!(root = %root.display(), region = %region_path.display(), "workspace created");
        Ok(Self { run_id: run_id.to_string(), runs_root, root, region_path, keep_intermediates, cleaned: false })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn region_path(&self) -> &Path {
        &self.region_path
    }

    pub fn partition_path(&self, mapper: usize) -> PathBuf {
        self.root.join("split").join(format!("part-{}.txt", mapper))
    }

    pub fn partition_paths(&self, mappers: usize) -> Vec<PathBuf> {
        (0..mappers).map(|m| self.partition_path(m)).collect()
    }

    pub fn bucket_path(&self, mapper: usize, reducer: usize) -> PathBuf {
        self.root.join("map_out").join(format!("task{}_part{}.txt", mapper, reducer))
    }

    /// The R bucket carriers written by `mapper`.
    pub fn mapper_buckets(&self, mapper: usize, reducers: usize) -> Vec<PathBuf> {
        (0..reducers).map(|r| self.bucket_path(mapper, r)).collect()
    }

    /// The M bucket carriers addressed to `reducer`.
    pub fn reducer_buckets(&self, reducer: usize, mappers: usize) -> Vec<PathBuf> {
        (0..mappers).map(|m| self.bucket_path(m, reducer)).collect()
    }

    pub fn run_path(&self, reducer: usize) -> PathBuf {
        self.root.join("reduce_out").join(format!("part-{:05}.txt", reducer))
    }

    pub fn run_paths(&self, reducers: usize) -> Vec<PathBuf> {
        (0..reducers).map(|r| self.run_path(r)).collect()
    }

    /// Remove the region backing file and, unless intermediates are kept, the
    /// run directory. Safe to call more than once.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;
        remove_if_present(&self.region_path, |p| fs::remove_file(p))
            .with_context(|| format!("remove region {}", self.region_path.display()))?;
        if self.keep_intermediates {
            warn!(root = %self.root.display(), "keeping intermediate files");
            return Ok(());
        }
        remove_if_present(&self.root, |p| fs::remove_dir_all(p)).with_context(|| format!("remove {}", self.root.display()))?;
        // Only succeeds when no other run is using the directory.
        let _ = fs::remove_dir(&self.runs_root);
        debug!(run_id = %self.run_id, "workspace cleaned up");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(error = %e, "workspace cleanup failed");
        }
    }
}

fn remove_if_present(path: &Path, remove: impl Fn(&Path) -> io::Result<()>) -> io::Result<()> {
    match remove(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_scoped_to_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "local-1-2", None, false).unwrap();
        assert!(ws.root().ends_with(".revgraph_runs/local-1-2"));
        assert!(ws.bucket_path(3, 1).ends_with("map_out/task3_part1.txt"));
        assert!(ws.run_path(2).ends_with("reduce_out/part-00002.txt"));
        assert!(ws.partition_path(0).ends_with("split/part-0.txt"));
        assert_eq!(ws.reducer_buckets(1, 2), vec![ws.bucket_path(0, 1), ws.bucket_path(1, 1)]);
        assert!(ws.region_path().starts_with(ws.root()));
    }

    #[test]
    fn cleanup_removes_everything_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let shm = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(dir.path(), "run", Some(shm.path()), false).unwrap();
        fs::write(ws.bucket_path(0, 0), "1 0\n").unwrap();
        fs::write(ws.region_path(), [0u8; 8]).unwrap();
        ws.cleanup().unwrap();
        ws.cleanup().unwrap();
        assert!(!dir.path().join(RUNS_DIR).exists());
        assert_eq!(fs::read_dir(shm.path()).unwrap().count(), 0);
    }

    #[test]
    fn cleanup_tolerates_paths_that_never_existed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(dir.path(), "run", None, false).unwrap();
        assert!(!ws.region_path().exists());
        fs::remove_dir_all(ws.root()).unwrap();
        ws.cleanup().unwrap();
        assert!(!dir.path().join(RUNS_DIR).exists());
    }

    #[test]
    fn drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ws = Workspace::create(dir.path(), "run", None, false).unwrap();
            fs::write(ws.partition_path(0), "0 1\n").unwrap();
        }
        assert!(!dir.path().join(RUNS_DIR).exists());
    }

    #[test]
    fn keep_intermediates_leaves_files_but_removes_region() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(dir.path(), "run", None, true).unwrap();
        fs::write(ws.run_path(0), "1: 0\n").unwrap();
        fs::write(ws.region_path(), [0u8; 8]).unwrap();
        ws.cleanup().unwrap();
        assert!(ws.run_path(0).exists());
        assert!(!ws.region_path().exists());
    }
}

//! LIFO cleanup stack for per-build temporary state.
//!
//! Temporary directories and files are registered as they are created and
//! removed in reverse order when the build finishes, fails, or unwinds.

use anyhow::{Context, Result};
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};

type CleanupFn = Box<dyn FnOnce() -> Result<()>>;

#[derive(Default)]
pub struct CleanupStack {
    jobs: Vec<(String, CleanupFn)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an arbitrary cleanup job.
    pub fn push(&mut self, label: impl Into<String>, job: impl FnOnce() -> Result<()> + 'static) {
        self.jobs.push((label.into(), Box::new(job)));
    }

    /// Create a fresh temporary directory owned by this stack.
    pub fn temp_dir(&mut self, prefix: &str) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .with_context(|| format!("creating temporary directory '{}*'", prefix))?
            .into_path();
        self.remove_on_exit(&dir);
        Ok(dir)
    }

    /// Remove `path` (file or directory) when the stack unwinds.
    pub fn remove_on_exit(&mut self, path: &Path) {
        let path = path.to_path_buf();
        let label = format!("remove {}", path.display());
        self.push(label, move || remove_path(&path));
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every job in LIFO order, then return `result`.
    ///
    /// Cleanup failures never mask the build's own error; they are logged and,
    /// when the build succeeded, the first one is returned.
    pub fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let cleanup = self.unwind();
        match (result, cleanup) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    fn unwind(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some((label, job)) = self.jobs.pop() {
            if let Err(err) = job() {
                warn!("cleanup step '{}' failed: {:#}", label, err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        let _ = self.unwind();
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("removing directory {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("removing file {}", path.display()))
    }
}

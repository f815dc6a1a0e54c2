//! Ordered description of what goes into the EFI system partition.
//!
//! Directories are kept sorted and every directory's ancestors are inserted
//! along with it, so iterating the manifest always visits a parent before
//! any of its children. Consumers can create directories in iteration order
//! without sorting or checking for parents themselves.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::filesystem::total_size;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactManifest {
    dirs: BTreeMap<String, Vec<PathBuf>>,
}

impl ArtifactManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `dir` (and all of its ancestors). Leading/trailing `/` are ignored.
    pub fn add_dir(&mut self, dir: &str) -> &mut Vec<PathBuf> {
        let dir = dir.trim_matches('/');
        let mut prefix = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.dirs.entry(prefix.clone()).or_default();
        }
        self.dirs.entry(prefix).or_default()
    }

    /// Add `src` to be copied into `dir` under its own file name.
    pub fn add_file(&mut self, dir: &str, src: impl Into<PathBuf>) {
        self.add_dir(dir).push(src.into());
    }

    /// Directories, parents first.
    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.dirs.keys().map(String::as_str).filter(|d| !d.is_empty())
    }

    /// `(dir, files)` pairs, parents first.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[PathBuf])> {
        self.dirs.iter().map(|(d, f)| (d.as_str(), f.as_slice()))
    }

    /// Every source file.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.dirs.values().flatten().map(PathBuf::as_path)
    }

    /// Sum of the sizes of every source file, in bytes.
    pub fn total_size(&self) -> Result<u64> {
        total_size(self.files())
    }

    /// Manifest mirroring the directory tree at `root`.
    pub fn from_tree(root: &Path) -> Result<Self> {
        let mut manifest = Self::new();
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let rel = rel.to_string_lossy().into_owned();
            if entry.file_type().is_dir() {
                manifest.add_dir(&rel);
            } else {
                let parent = Path::new(&rel)
                    .parent()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                manifest.add_file(&parent, entry.path());
            }
        }
        Ok(manifest)
    }
}

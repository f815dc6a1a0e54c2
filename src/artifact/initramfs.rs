//! Initramfs builder.
//!
//! Archives a prepared rootfs into a compressed newc cpio. Pseudo and
//! runtime-only filesystems at the root are left out; everything else is
//! archived as-is, in byte-wise name order.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

use super::cpio::NewcWriter;
use crate::cancel::Cancellation;

/// Top-level directories never included in the archive.
pub const SKIPPED_ROOT_DIRS: &[&str] = &["sys", "run", "dev", "tmp", "proc"];

/// zstd level used for the initrd.
pub const ZSTD_LEVEL: i32 = 19;

const CHECKPOINT_EVERY: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitrdCompression {
    #[default]
    Zstd,
    Gzip,
}

impl InitrdCompression {
    pub fn extension(self) -> &'static str {
        match self {
            InitrdCompression::Zstd => "zst",
            InitrdCompression::Gzip => "gz",
        }
    }

    /// Name of the compressed initrd, e.g. `initrd.zst`.
    pub fn file_name(self) -> String {
        format!("initrd.{}", self.extension())
    }
}

impl FromStr for InitrdCompression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zstd" => Ok(InitrdCompression::Zstd),
            "gzip" => Ok(InitrdCompression::Gzip),
            other => anyhow::bail!("invalid initrd compression: {} (expected zstd or gzip)", other),
        }
    }
}

/// Write `root` as a newc archive to `out`. Returns the number of entries.
pub fn write_archive(root: &Path, out: impl Write, cancel: &Cancellation) -> Result<u64> {
    let mut writer = NewcWriter::new(out);
    let mut count = 0u64;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() == 1
                && e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| SKIPPED_ROOT_DIRS.contains(&n)))
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let name = if rel.as_os_str().is_empty() {
            ".".to_string()
        } else {
            rel.to_str()
                .with_context(|| format!("non UTF-8 path in rootfs: {}", rel.display()))?
                .to_string()
        };

        let meta = entry
            .metadata()
            .with_context(|| format!("reading metadata of {}", entry.path().display()))?;
        let perm = meta.permissions().mode();
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("reading link {}", entry.path().display()))?;
            let target = target
                .to_str()
                .with_context(|| format!("non UTF-8 link target in {}", name))?
                .to_string();
            writer.append_symlink(&name, &target)?;
        } else if file_type.is_dir() {
            writer.append_dir(&name, perm)?;
        } else if file_type.is_file() {
            let file = File::open(entry.path())
                .with_context(|| format!("opening {}", entry.path().display()))?;
            writer.append_file(&name, perm, meta.len(), BufReader::new(file))?;
        } else {
            writer.append_special(&name, meta.mode(), meta.rdev())?;
        }

        count += 1;
        if count % CHECKPOINT_EVERY == 0 {
            cancel.checkpoint()?;
        }
    }

    writer.finish()?;
    Ok(count)
}

/// Build a compressed initramfs from `root` at `output`.
///
/// The raw archive is written next to `output` and removed afterwards. On
/// any failure neither the raw archive nor a partial `output` is left behind.
pub fn build_initramfs(
    root: &Path,
    output: &Path,
    compression: InitrdCompression,
    cancel: &Cancellation,
) -> Result<PathBuf> {
    let raw = output.with_extension("cpio");
    let result = build_inner(root, &raw, output, compression, cancel);
    let _ = fs::remove_file(&raw);
    if result.is_err() {
        let _ = fs::remove_file(output);
    }
    result.map(|_| output.to_path_buf())
}

fn build_inner(
    root: &Path,
    raw: &Path,
    output: &Path,
    compression: InitrdCompression,
    cancel: &Cancellation,
) -> Result<()> {
    info!("[initramfs] archiving {}", root.display());
    let file = File::create(raw).with_context(|| format!("creating {}", raw.display()))?;
    let count = write_archive(root, BufWriter::new(file), cancel)?;
    debug!("[initramfs] {} entries", count);

    cancel.checkpoint()?;
    compress(raw, output, compression)?;

    let size = fs::metadata(output)?.len();
    info!(
        "[initramfs] wrote {} ({:.1} MiB, {:?})",
        output.display(),
        size as f64 / (1024.0 * 1024.0),
        compression
    );
    Ok(())
}

fn compress(raw: &Path, output: &Path, compression: InitrdCompression) -> Result<()> {
    let mut input = BufReader::new(
        File::open(raw).with_context(|| format!("opening {}", raw.display()))?,
    );
    let out = File::create(output).with_context(|| format!("creating {}", output.display()))?;

    match compression {
        InitrdCompression::Zstd => {
            let mut encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)?;
            io::copy(&mut input, &mut encoder).context("compressing initramfs with zstd")?;
            encoder.finish()?;
        }
        InitrdCompression::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(out, flate2::Compression::best());
            io::copy(&mut input, &mut encoder).context("compressing initramfs with gzip")?;
            encoder.finish()?;
        }
    }
    Ok(())
}

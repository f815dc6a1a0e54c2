//! Filesystem utilities for artifact building.
//!
//! Copying rootfs and overlay trees, moving finished artifacts into place and
//! normalizing permissions of staging trees before they are mastered.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively copy a directory, preserving symlinks.
///
/// Existing files in `dst` are overwritten, so this also merges an overlay
/// tree on top of a populated directory.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            if dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
        // Device nodes and sockets in a rootfs are not carried over; the
        // initramfs mounts devtmpfs.
    }

    Ok(())
}

/// Atomically move a file by renaming, with fallback to copy+delete.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem, fall back to copy+delete
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// Move every entry of `src` into `dst`, replacing same-named files.
pub fn move_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            move_dir_contents(&entry.path(), &target)?;
        } else {
            atomic_move(&entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Normalize modes under `root`: directories 0755, files 0644, and boot
/// binaries (`.efi`, `.img`) 0755. Symlinks are left alone.
pub fn normalize_permissions(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let file_type = entry.file_type();
        let mode = if file_type.is_dir() {
            0o755
        } else if file_type.is_file() {
            let boot_binary = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("efi") || e.eq_ignore_ascii_case("img"));
            if boot_binary {
                0o755
            } else {
                0o644
            }
        } else {
            continue;
        };
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode of {}", entry.path().display()))?;
    }
    Ok(())
}

/// Total size in bytes of the regular files in `paths`.
pub fn total_size<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Result<u64> {
    let mut total = 0u64;
    for path in paths {
        total += fs::metadata(path)
            .with_context(|| format!("reading size of {}", path.display()))?
            .len();
    }
    Ok(total)
}

//! Rootfs preparation.
//!
//! The caller's extracted rootfs is never modified. It is copied into the
//! build's work directory, optionally overlaid, and turned into something the
//! initramfs can boot straight into: `/init` points at immucore, the mount
//! points immucore expects exist, and the kernel is lifted out of `/boot`.

use anyhow::{bail, Context, Result};
use log::info;
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::filesystem::copy_dir_recursive;
use crate::cancel::Cancellation;
use crate::os_release;

/// Target of the `/init` symlink.
pub const INIT_TARGET: &str = "/usr/bin/immucore";

/// Directories created in every prepared rootfs.
pub const EXTRA_DIRS: &[&str] = &["oem", "efi", "usr/local/cloud-config"];

/// Kernel location inside the rootfs (usually a symlink).
pub const KERNEL_PATH: &str = "boot/vmlinuz";

const MAX_LINK_HOPS: usize = 40;

/// A rootfs copy ready to be archived.
#[derive(Debug, Clone)]
pub struct PreparedRootfs {
    pub root: PathBuf,
    /// Kernel image, moved out of the tree.
    pub kernel: PathBuf,
    /// `etc/os-release` copied out of the tree, fed to the UKI.
    pub os_release: PathBuf,
    /// Release from os-release.
    pub version: String,
}

/// Copy `source` to `<work>/rootfs` and prepare it for archiving.
pub fn prepare_rootfs(
    source: &Path,
    work: &Path,
    overlay: Option<&Path>,
    cancel: &Cancellation,
) -> Result<PreparedRootfs> {
    let root = work.join("rootfs");
    info!("[rootfs] copying {}", source.display());
    copy_dir_recursive(source, &root)?;
    cancel.checkpoint()?;

    if let Some(overlay) = overlay {
        info!("[rootfs] applying overlay {}", overlay.display());
        copy_dir_recursive(overlay, &root)?;
        cancel.checkpoint()?;
    }

    let version = os_release::find_release(&root)?;

    let os_release = work.join("os-release");
    fs::copy(root.join(os_release::OS_RELEASE_PATH), &os_release)
        .context("copying os-release")?;

    let init = root.join("init");
    if init.exists() || init.is_symlink() {
        fs::remove_file(&init).context("removing existing /init")?;
    }
    std::os::unix::fs::symlink(INIT_TARGET, &init).context("linking /init")?;

    for dir in EXTRA_DIRS {
        fs::create_dir_all(root.join(dir))
            .with_context(|| format!("creating /{}", dir))?;
    }

    let kernel_src = resolve_in_root(&root, Path::new(KERNEL_PATH))?;
    let kernel = work.join("vmlinuz");
    fs::copy(&kernel_src, &kernel)
        .with_context(|| format!("copying kernel {}", kernel_src.display()))?;

    let boot = root.join("boot");
    if boot.exists() {
        fs::remove_dir_all(&boot).context("removing /boot from rootfs")?;
    }

    info!("[rootfs] prepared release {}", version);
    Ok(PreparedRootfs {
        root,
        kernel,
        os_release,
        version,
    })
}

/// Resolve `rel` inside `root`, following symlinks as if `root` were `/`.
pub fn resolve_in_root(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut current = rel.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        let host = root.join(&current);
        let meta = fs::symlink_metadata(&host)
            .with_context(|| format!("/{} not found in rootfs", current.display()))?;
        if !meta.file_type().is_symlink() {
            return Ok(host);
        }
        let target = fs::read_link(&host)?;
        let joined = if target.is_absolute() {
            target
        } else {
            current.parent().unwrap_or(Path::new("")).join(target)
        };
        current = normalize(&joined);
    }
    bail!("too many levels of symlinks resolving /{}", rel.display())
}

/// Lexically normalize `path` to a root-relative path that cannot escape.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn sample(temp: &TempDir) -> PathBuf {
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("boot")).unwrap();
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::write(src.join("boot/vmlinuz-6.6.0"), b"kernel").unwrap();
        symlink("vmlinuz-6.6.0", src.join("boot/vmlinuz")).unwrap();
        fs::write(src.join("etc/os-release"), "KAIROS_RELEASE=\"v3.0.0\"\n").unwrap();
        src
    }

    #[test]
    fn test_prepare_rootfs() {
        let temp = TempDir::new().unwrap();
        let src = sample(&temp);
        let work = temp.path().join("work");

        let prepared = prepare_rootfs(&src, &work, None, &Cancellation::new()).unwrap();

        assert_eq!(prepared.version, "v3.0.0");
        assert_eq!(fs::read(&prepared.kernel).unwrap(), b"kernel");
        assert_eq!(
            fs::read_link(prepared.root.join("init")).unwrap(),
            PathBuf::from(INIT_TARGET)
        );
        for dir in EXTRA_DIRS {
            assert!(prepared.root.join(dir).is_dir());
        }
        assert!(!prepared.root.join("boot").exists());
        // the source tree is untouched
        assert!(src.join("boot/vmlinuz").is_symlink());
        assert!(!src.join("init").exists());
    }

    #[test]
    fn test_overlay_applied() {
        let temp = TempDir::new().unwrap();
        let src = sample(&temp);
        let overlay = temp.path().join("overlay");
        fs::create_dir_all(overlay.join("etc")).unwrap();
        fs::write(overlay.join("etc/motd"), "hi").unwrap();

        let prepared =
            prepare_rootfs(&src, &temp.path().join("work"), Some(&overlay), &Cancellation::new())
                .unwrap();
        assert_eq!(fs::read_to_string(prepared.root.join("etc/motd")).unwrap(), "hi");
    }

    #[test]
    fn test_missing_kernel() {
        let temp = TempDir::new().unwrap();
        let src = sample(&temp);
        fs::remove_file(src.join("boot/vmlinuz")).unwrap();
        assert!(prepare_rootfs(&src, &temp.path().join("work"), None, &Cancellation::new()).is_err());
    }

    #[test]
    fn test_absolute_link_stays_in_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("usr/lib/modules")).unwrap();
        fs::create_dir_all(root.join("boot")).unwrap();
        fs::write(root.join("usr/lib/modules/vmlinuz"), b"k").unwrap();
        symlink("/usr/lib/modules/vmlinuz", root.join("boot/vmlinuz")).unwrap();

        let resolved = resolve_in_root(root, Path::new("boot/vmlinuz")).unwrap();
        assert_eq!(resolved, root.join("usr/lib/modules/vmlinuz"));
    }

    #[test]
    fn test_link_loop_detected() {
        let temp = TempDir::new().unwrap();
        symlink("b", temp.path().join("a")).unwrap();
        symlink("a", temp.path().join("b")).unwrap();
        assert!(resolve_in_root(temp.path(), Path::new("a")).is_err());
    }
}

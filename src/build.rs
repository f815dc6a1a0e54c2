//! `build-uki`: rootfs in, signed boot artifacts out.
//!
//! ```text
//! rootfs ─► prepare ─► initramfs ─► UKI per cmdline ─┬─► raw tree
//!                                                   ├─► ESP image ─► ISO + sha256
//!                                                   └─► OCI image archive
//! ```
//!
//! Every intermediate lives in a per-build work dir owned by a
//! [`CleanupStack`]; only the terminal artifacts reach the output dir.

use anyhow::{Context, Result};
use fs2::FileExt;
use log::info;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::arch::SupportFiles;
use crate::artifact::esp::{build_esp_image, ESP_IMAGE_NAME};
use crate::artifact::initramfs::build_initramfs;
use crate::artifact::iso::assemble_iso;
use crate::artifact::manifest::ArtifactManifest;
use crate::artifact::package::{package_container, package_tree};
use crate::artifact::rootfs::prepare_rootfs;
use crate::artifact::uki::{build_uki_tree, UkiInputs, UkiTools};
use crate::cancel::Cancellation;
use crate::cleanup::CleanupStack;
use crate::cmdline::CmdlineSet;
use crate::config::{OutputKind, UkiBuildConfig};
use crate::preflight;
use crate::tools::{host, Toolchain};

/// Advisory lock serializing builds into one output dir.
pub const LOCK_FILE: &str = ".enki.lock";

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub kind: OutputKind,
    pub version: String,
    /// Terminal artifacts, relative to nothing (absolute or as configured).
    pub artifacts: Vec<PathBuf>,
}

pub struct BuildUki {
    config: UkiBuildConfig,
    tools: Toolchain,
    cancel: Cancellation,
}

impl BuildUki {
    pub fn new(config: UkiBuildConfig, tools: Toolchain, cancel: Cancellation) -> Self {
        Self {
            config,
            tools,
            cancel,
        }
    }

    pub fn config(&self) -> &UkiBuildConfig {
        &self.config
    }

    /// Host binaries needed by the production toolchain for this build.
    pub fn check_host_tools(&self) -> Result<()> {
        preflight::check_required_tools(&host::required_tools(self.config.output_kind))
    }

    /// Check every input before anything is written.
    pub fn preflight(&self) -> Result<SupportFiles> {
        preflight::check_input(&self.config.rootfs)?;
        preflight::check_key_dir(&self.config.keys_dir)?;
        if let Some(ref overlay) = self.config.overlay_rootfs {
            preflight::check_input(overlay)?;
        }
        if let Some(ref overlay) = self.config.iso.overlay {
            preflight::check_input(overlay)?;
        }
        let support = SupportFiles::in_dir(self.config.arch, &self.config.support_dir);
        support.verify()?;
        Ok(support)
    }

    pub fn run(&self) -> Result<BuildOutput> {
        let support = self.preflight()?;

        let output_dir = &self.config.output_dir;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        let lock_path = output_dir.join(LOCK_FILE);
        let lock = File::create(&lock_path)
            .with_context(|| format!("creating {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!("another build is writing to {}", output_dir.display())
        })?;

        // The lock file stays; unlinking it while held would let a second
        // build lock a fresh inode.
        let mut cleanup = CleanupStack::new();
        let result = self.run_locked(&support, &mut cleanup);
        let result = cleanup.finish(result);
        drop(lock);
        result
    }

    fn run_locked(&self, support: &SupportFiles, cleanup: &mut CleanupStack) -> Result<BuildOutput> {
        let config = &self.config;
        let cancel = &self.cancel;
        let work = cleanup.temp_dir("enki-build-")?;

        let prepared = prepare_rootfs(
            &config.rootfs,
            &work,
            config.overlay_rootfs.as_deref(),
            cancel,
        )?;
        info!(
            "[build] {} {} for {}",
            config.entry.boot_branding, prepared.version, config.arch
        );

        let initrd = work.join(config.initrd_compression.file_name());
        build_initramfs(&prepared.root, &initrd, config.initrd_compression, cancel)?;
        // The uncompressed tree is no longer needed.
        fs::remove_dir_all(&prepared.root).context("removing rootfs copy")?;

        let cmdlines = CmdlineSet::new(config.extend_cmdline.as_deref());
        let variants = cmdlines.variants(
            &config.entry.boot_branding,
            &config.extra_cmdlines,
            &config.single_efi_cmdlines,
        )?;

        let tree = work.join("tree");
        build_uki_tree(
            &UkiInputs {
                kernel: &prepared.kernel,
                initrd: &initrd,
                os_release: &prepared.os_release,
                version: &prepared.version,
                support,
                keys_dir: &config.keys_dir,
                cmdlines: &cmdlines,
            },
            &variants,
            &config.entry,
            &config.loader,
            &UkiTools {
                composer: self.tools.composer.as_ref(),
                signer: self.tools.signer.as_ref(),
            },
            &tree,
            cancel,
        )?;
        cancel.checkpoint()?;

        let artifacts = match config.output_kind {
            OutputKind::Uki => {
                package_tree(&tree, &config.output_dir)?;
                vec![config.output_dir.clone()]
            }
            OutputKind::Iso => self.build_iso(&tree, &work, &prepared.version)?,
            OutputKind::Container => {
                vec![package_container(
                    &tree,
                    &config.output_dir,
                    &prepared.version,
                    config.arch,
                    &work,
                )?]
            }
        };

        for artifact in &artifacts {
            info!("[build] wrote {}", artifact.display());
        }
        Ok(BuildOutput {
            kind: config.output_kind,
            version: prepared.version,
            artifacts,
        })
    }

    fn build_iso(&self, tree: &Path, work: &Path, version: &str) -> Result<Vec<PathBuf>> {
        let manifest = ArtifactManifest::from_tree(tree)?;
        let esp = work.join(ESP_IMAGE_NAME);
        build_esp_image(&manifest, &esp, self.tools.formatter.as_ref(), &self.cancel)?;

        let iso = self
            .config
            .output_dir
            .join(self.config.iso.file_name(version));
        let checksum = assemble_iso(
            &esp,
            &work.join("iso"),
            &iso,
            &self.config.iso,
            self.tools.iso.as_ref(),
            &self.cancel,
        )?;
        Ok(vec![iso, checksum])
    }
}

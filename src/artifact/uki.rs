//! Unified kernel images and their systemd-boot entries.
//!
//! For every cmdline variant one `<stem>.efi` and one `<stem>.conf` are
//! written into an artifact tree laid out the way the ESP must look:
//!
//! ```text
//! EFI/BOOT/BOOTX64.EFI          signed systemd-boot
//! EFI/kairos/<stem>.efi         signed, measured UKI
//! EFI/tools/
//! loader/loader.conf
//! loader/entries/<stem>.conf
//! loader/keys/auto/{PK,KEK,db}.{der,auth}
//! ```

use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::arch::SupportFiles;
use crate::cancel::Cancellation;
use crate::cmdline::{CmdlineSet, CmdlineVariant};
use crate::tools::{Signer, SigningKeys, UkiComposer, UkiRequest};

pub const FALLBACK_DIR: &str = "EFI/BOOT";
pub const UKI_DIR: &str = "EFI/kairos";
pub const TOOLS_DIR: &str = "EFI/tools";
pub const LOADER_DIR: &str = "loader";
pub const ENTRIES_DIR: &str = "loader/entries";
pub const AUTO_ENROLL_DIR: &str = "loader/keys/auto";

/// Key material copied for firmware auto-enrollment.
pub const ENROLL_KEY_FILES: &[&str] = &["PK.der", "KEK.der", "db.der", "PK.auth", "KEK.auth", "db.auth"];

const MIB: u64 = 1024 * 1024;

fn exceeds_size_warning(size: u64, warn_mib: u64) -> bool {
    size > warn_mib.saturating_mul(MIB)
}

/// Options for boot entries and the UKIs behind them.
#[derive(Debug, Clone)]
pub struct UkiEntryOptions {
    pub boot_branding: String,
    pub include_version: bool,
    pub include_cmdline: bool,
    /// UKIs larger than this only produce a warning.
    pub efi_size_warn_mib: u64,
}

impl Default for UkiEntryOptions {
    fn default() -> Self {
        Self {
            boot_branding: "Kairos".to_string(),
            include_version: false,
            include_cmdline: false,
            efi_size_warn_mib: 1024,
        }
    }
}

/// Options for `loader.conf`.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Entry booted by default; `.conf` is appended when missing.
    pub default_entry: Option<String>,
    pub secure_boot_enroll: String,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            default_entry: None,
            secure_boot_enroll: "if-safe".to_string(),
        }
    }
}

/// One `loader/entries/*.conf` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootLoaderEntry {
    pub title: String,
    pub efi_path: String,
    pub version: Option<String>,
    pub cmdline: Option<String>,
}

impl BootLoaderEntry {
    pub fn for_variant(
        variant: &CmdlineVariant,
        cmdlines: &CmdlineSet,
        options: &UkiEntryOptions,
        version: &str,
    ) -> Self {
        let extra = cmdlines.extra(&variant.cmdline);
        Self {
            title: variant.title.clone(),
            efi_path: format!("/{}/{}", UKI_DIR, variant.efi_name()),
            version: options.include_version.then(|| version.to_string()),
            cmdline: (options.include_cmdline && !extra.is_empty()).then_some(extra),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("title {}\nefi {}\n", self.title, self.efi_path);
        if let Some(ref version) = self.version {
            out.push_str(&format!("version {}\n", version));
        }
        if let Some(ref cmdline) = self.cmdline {
            out.push_str(&format!("cmdline {}\n", cmdline));
        }
        out
    }
}

/// `loader/loader.conf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub default_entry: String,
    pub timeout: u32,
    pub secure_boot_enroll: String,
}

impl LoaderConfig {
    /// `fallback_entry` is used when no default is configured.
    pub fn new(options: &LoaderOptions, fallback_entry: &str) -> Self {
        let entry = options.default_entry.as_deref().unwrap_or(fallback_entry);
        let default_entry = if entry.ends_with(".conf") {
            entry.to_string()
        } else {
            format!("{}.conf", entry)
        };
        Self {
            default_entry,
            timeout: 5,
            secure_boot_enroll: options.secure_boot_enroll.clone(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "default {}\ntimeout {}\nconsole-mode max\neditor no\nsecure-boot-enroll {}\n",
            self.default_entry, self.timeout, self.secure_boot_enroll
        )
    }
}

/// Inputs shared by every UKI of a build.
pub struct UkiInputs<'a> {
    pub kernel: &'a Path,
    pub initrd: &'a Path,
    pub os_release: &'a Path,
    pub version: &'a str,
    pub support: &'a SupportFiles,
    pub keys_dir: &'a Path,
    pub cmdlines: &'a CmdlineSet,
}

/// Collaborators used to build the tree.
pub struct UkiTools<'a> {
    pub composer: &'a dyn UkiComposer,
    pub signer: &'a dyn Signer,
}

/// Populate `tree` with a UKI and entry per variant, the signed boot loader,
/// `loader.conf` and the auto-enrollment keys.
pub fn build_uki_tree(
    inputs: &UkiInputs<'_>,
    variants: &[CmdlineVariant],
    options: &UkiEntryOptions,
    loader: &LoaderOptions,
    tools: &UkiTools<'_>,
    tree: &Path,
    cancel: &Cancellation,
) -> Result<()> {
    inputs.support.verify()?;
    let keys = SigningKeys::in_dir(inputs.keys_dir);

    for dir in [FALLBACK_DIR, UKI_DIR, TOOLS_DIR, ENTRIES_DIR, AUTO_ENROLL_DIR] {
        fs::create_dir_all(tree.join(dir))
            .with_context(|| format!("creating {}", tree.join(dir).display()))?;
    }

    for variant in variants {
        cancel.checkpoint()?;
        build_variant(inputs, variant, options, &keys, tools.composer, tree)?;
    }

    cancel.checkpoint()?;
    let loader_out = tree
        .join(FALLBACK_DIR)
        .join(inputs.support.arch.fallback_loader_name());
    info!("[uki] signing {}", inputs.support.systemd_boot.display());
    tools
        .signer
        .sign(&keys, &inputs.support.systemd_boot, &loader_out)?;

    let fallback = variants
        .first()
        .map(|v| v.file_stem.as_str())
        .unwrap_or(crate::cmdline::ARTIFACT_BASE_NAME);
    let config = LoaderConfig::new(loader, fallback);
    fs::write(tree.join(LOADER_DIR).join("loader.conf"), config.render())
        .context("writing loader.conf")?;

    for name in ENROLL_KEY_FILES {
        let src = inputs.keys_dir.join(name);
        fs::copy(&src, tree.join(AUTO_ENROLL_DIR).join(name))
            .with_context(|| format!("copying {}", src.display()))?;
    }

    Ok(())
}

fn build_variant(
    inputs: &UkiInputs<'_>,
    variant: &CmdlineVariant,
    options: &UkiEntryOptions,
    keys: &SigningKeys,
    composer: &dyn UkiComposer,
    tree: &Path,
) -> Result<PathBuf> {
    let efi = tree.join(UKI_DIR).join(variant.efi_name());
    info!("[uki] building {} ({})", variant.efi_name(), variant.title);

    composer.compose(&UkiRequest {
        kernel: inputs.kernel,
        initrd: inputs.initrd,
        cmdline: &variant.cmdline,
        os_release: inputs.os_release,
        stub: &inputs.support.stub,
        keys,
        output: &efi,
    })?;

    let size = fs::metadata(&efi)
        .with_context(|| format!("UKI {} was not created", efi.display()))?
        .len();
    if exceeds_size_warning(size, options.efi_size_warn_mib) {
        warn!(
            "{} is {} MiB, larger than {} MiB; some firmware may fail to boot it",
            variant.efi_name(),
            size.div_ceil(MIB),
            options.efi_size_warn_mib
        );
    }

    let entry = BootLoaderEntry::for_variant(variant, inputs.cmdlines, options, inputs.version);
    fs::write(tree.join(ENTRIES_DIR).join(variant.conf_name()), entry.render())
        .with_context(|| format!("writing {}", variant.conf_name()))?;

    Ok(efi)
}

//! Hybrid ISO assembly.
//!
//! The ESP image is the UEFI El Torito entry. When the staging tree carries
//! BIOS boot files (usually supplied through the ISO overlay) they are
//! registered too and the image gets an isohybrid MBR.

use anyhow::{Context, Result};
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use super::esp::ESP_IMAGE_NAME;
use super::filesystem::{copy_dir_recursive, normalize_permissions};
use crate::cancel::Cancellation;
use crate::tools::{BiosBoot, IsoMaster, IsoRequest};

/// Default volume label.
pub const DEFAULT_LABEL: &str = "UKI_ISO_INSTALL";

/// Boot catalog created when a BIOS entry is registered.
pub const BOOT_CATALOG: &str = "boot/boot.catalog";

/// Options for the ISO image.
#[derive(Debug, Clone)]
pub struct IsoOptions {
    pub label: String,
    /// File stem of the ISO; `kairos_<version>` when unset.
    pub name: Option<String>,
    /// Tree merged into the ISO root.
    pub overlay: Option<PathBuf>,
    /// El Torito BIOS image, relative to the ISO root.
    pub bios_image: String,
    /// isohybrid MBR template, relative to the ISO root.
    pub bios_mbr: String,
}

impl Default for IsoOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            name: None,
            overlay: None,
            bios_image: "boot/x86_64/loader/eltorito.img".to_string(),
            bios_mbr: "boot/x86_64/loader/boot_hybrid.img".to_string(),
        }
    }
}

impl IsoOptions {
    /// ISO file name for `version`.
    pub fn file_name(&self, version: &str) -> String {
        match self.name {
            Some(ref name) => format!("{}.iso", name.trim_end_matches(".iso")),
            None => format!("kairos_{}.iso", version),
        }
    }

    fn bios_boot(&self, staging: &Path) -> Option<BiosBoot> {
        let image = staging.join(&self.bios_image);
        let mbr = staging.join(&self.bios_mbr);
        (image.is_file() && mbr.is_file()).then(|| BiosBoot {
            image: self.bios_image.clone(),
            catalog: BOOT_CATALOG.to_string(),
            mbr,
        })
    }
}

/// Master `output` from `esp_image` in the `staging` dir and write its
/// `.sha256` next to it. Returns the checksum path.
pub fn assemble_iso(
    esp_image: &Path,
    staging: &Path,
    output: &Path,
    options: &IsoOptions,
    master: &dyn IsoMaster,
    cancel: &Cancellation,
) -> Result<PathBuf> {
    fs::create_dir_all(staging).with_context(|| format!("creating {}", staging.display()))?;
    fs::copy(esp_image, staging.join(ESP_IMAGE_NAME))
        .with_context(|| format!("copying {} into ISO staging", esp_image.display()))?;

    if let Some(ref overlay) = options.overlay {
        info!("[iso] applying overlay {}", overlay.display());
        copy_dir_recursive(overlay, staging)?;
    }
    normalize_permissions(staging)?;

    let bios = options.bios_boot(staging);
    if bios.is_none() {
        warn!(
            "no BIOS boot files at {} and {}; the ISO will only boot on UEFI",
            options.bios_image, options.bios_mbr
        );
    }

    if output.exists() {
        warn!("removing existing {}", output.display());
        fs::remove_file(output).with_context(|| format!("removing {}", output.display()))?;
    }

    cancel.checkpoint()?;
    info!("[iso] mastering {}", output.display());
    master.master(&IsoRequest {
        staging,
        output,
        label: &options.label,
        efi_image: ESP_IMAGE_NAME,
        bios,
    })?;

    write_checksum(output)
}

/// Write `<file>.sha256` as `<hex>  <file name>\n`.
pub fn write_checksum(file: &Path) -> Result<PathBuf> {
    let mut reader = BufReader::new(
        File::open(file).with_context(|| format!("opening {}", file.display()))?,
    );
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).with_context(|| format!("hashing {}", file.display()))?;
    let hash = hex::encode(hasher.finalize());

    let name = file
        .file_name()
        .context("ISO path has no file name")?
        .to_string_lossy()
        .into_owned();
    let checksum_path = PathBuf::from(format!("{}.sha256", file.display()));
    fs::write(&checksum_path, format!("{}  {}\n", hash, name))
        .with_context(|| format!("writing {}", checksum_path.display()))?;

    info!("[iso] SHA256: {}...{}", &hash[..8], &hash[hash.len() - 8..]);
    Ok(checksum_path)
}

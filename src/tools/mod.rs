//! External tool seams.
//!
//! The pipeline never names a binary directly. UKI composition, PE signing,
//! FAT image handling and ISO mastering each sit behind a trait so that the
//! stages can be driven by [`host::HostTools`] in production and by
//! in-memory fakes in tests.

pub mod host;

use anyhow::Result;
use std::path::{Path, PathBuf};

pub use host::HostTools;

/// Paths of the `db` key pair and the PCR signing key in a key directory.
#[derive(Debug, Clone)]
pub struct SigningKeys {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub pcr_key: PathBuf,
}

impl SigningKeys {
    pub fn in_dir(keys_dir: &Path) -> Self {
        Self {
            key: keys_dir.join("db.key"),
            cert: keys_dir.join("db.pem"),
            pcr_key: keys_dir.join("tpm2-pcr-private.pem"),
        }
    }
}

/// Inputs for one unified kernel image.
#[derive(Debug, Clone)]
pub struct UkiRequest<'a> {
    pub kernel: &'a Path,
    pub initrd: &'a Path,
    pub cmdline: &'a str,
    pub os_release: &'a Path,
    pub stub: &'a Path,
    pub keys: &'a SigningKeys,
    pub output: &'a Path,
}

/// Builds a signed, PCR-measured UKI.
pub trait UkiComposer {
    fn compose(&self, request: &UkiRequest<'_>) -> Result<()>;
}

/// Signs a PE binary for secure boot.
pub trait Signer {
    fn sign(&self, keys: &SigningKeys, input: &Path, output: &Path) -> Result<()>;
}

/// Creates and populates FAT32 images.
///
/// Directory arguments are image-relative and use `/` separators
/// (`EFI/BOOT`), never a leading `::`.
pub trait ImageFormatter {
    /// Allocate a zero-filled image of `size_mib` MiB and format it FAT32.
    fn create(&self, image: &Path, size_mib: u64) -> Result<()>;
    /// Create one directory; its parent must already exist.
    fn mkdir(&self, image: &Path, dir: &str) -> Result<()>;
    /// Copy `src` into `dir`, keeping only its file name.
    fn copy(&self, image: &Path, src: &Path, dir: &str) -> Result<()>;
}

/// Legacy BIOS boot files registered next to the UEFI entry.
#[derive(Debug, Clone)]
pub struct BiosBoot {
    /// El Torito boot image, relative to the staging dir.
    pub image: String,
    /// Boot catalog path to create, relative to the staging dir.
    pub catalog: String,
    /// isohybrid MBR template (absolute).
    pub mbr: PathBuf,
}

/// Inputs for mastering a hybrid ISO.
#[derive(Debug, Clone)]
pub struct IsoRequest<'a> {
    pub staging: &'a Path,
    pub output: &'a Path,
    pub label: &'a str,
    /// ESP image relative to `staging`.
    pub efi_image: &'a str,
    pub bios: Option<BiosBoot>,
}

/// Writes an ISO9660 image from a staging tree.
pub trait IsoMaster {
    fn master(&self, request: &IsoRequest<'_>) -> Result<()>;
}

/// The collaborators a build runs with.
pub struct Toolchain {
    pub composer: Box<dyn UkiComposer>,
    pub signer: Box<dyn Signer>,
    pub formatter: Box<dyn ImageFormatter>,
    pub iso: Box<dyn IsoMaster>,
}

impl Toolchain {
    /// Every collaborator backed by the host binaries.
    pub fn host(tools: HostTools) -> Self {
        Self {
            composer: Box::new(tools.clone()),
            signer: Box::new(tools.clone()),
            formatter: Box::new(tools.clone()),
            iso: Box::new(tools),
        }
    }
}

//! Supported build architectures and their EFI support files.

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// Directory the EFI stub and systemd-boot binaries are installed to.
pub const DEFAULT_SUPPORT_DIR: &str = "/usr/kairos";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    /// Parse any common spelling (`amd64`, `x86_64`, `arm64`, `aarch64`).
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x86-64" => Ok(Arch::X86_64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(BuildError::UnsupportedArch(other.to_string()).into()),
        }
    }

    /// Architecture of the running host.
    pub fn host() -> Result<Self> {
        Self::parse(std::env::consts::ARCH)
    }

    /// Name used in OCI image configs.
    pub fn oci_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    /// File name of the EFI stub the UKI is composed around.
    pub fn stub_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "linuxx64.efi.stub",
            Arch::Arm64 => "linuxaa64.efi.stub",
        }
    }

    /// File name of the systemd-boot binary.
    pub fn systemd_boot_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "systemd-bootx64.efi",
            Arch::Arm64 => "systemd-bootaa64.efi",
        }
    }

    /// Removable-media fallback loader name under `EFI/BOOT`.
    pub fn fallback_loader_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "BOOTX64.EFI",
            Arch::Arm64 => "BOOTAA64.EFI",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Resolved EFI stub and boot loader for one architecture.
#[derive(Debug, Clone)]
pub struct SupportFiles {
    pub arch: Arch,
    pub stub: PathBuf,
    pub systemd_boot: PathBuf,
}

impl SupportFiles {
    pub fn in_dir(arch: Arch, dir: &Path) -> Self {
        Self {
            arch,
            stub: dir.join(arch.stub_name()),
            systemd_boot: dir.join(arch.systemd_boot_name()),
        }
    }

    /// Fail if either file is missing.
    pub fn verify(&self) -> Result<()> {
        for path in [&self.stub, &self.systemd_boot] {
            if !path.is_file() {
                return Err(BuildError::MissingSupportFile {
                    arch: self.arch.to_string(),
                    path: path.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

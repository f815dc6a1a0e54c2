//! Build configuration.
//!
//! Each component takes its own options struct ([`UkiEntryOptions`],
//! [`LoaderOptions`], [`IsoOptions`], [`KeySetOptions`]); [`UkiBuildConfig`]
//! bundles the ones a `build-uki` run needs. Values come from, in order of
//! precedence: command-line flags, `enki.toml`, and the defaults below.
//!
//! ```toml
//! [build_uki]
//! boot_branding = "Kairos"
//! secure_boot_enroll = "manual"
//! include_version_in_config = true
//! efi_size_warn = 512
//!
//! [genkey]
//! expiration_in_days = 730
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::arch::{Arch, DEFAULT_SUPPORT_DIR};
use crate::artifact::initramfs::InitrdCompression;
use crate::artifact::iso::IsoOptions;
use crate::artifact::uki::{LoaderOptions, UkiEntryOptions};
use crate::process::DEFAULT_TIMEOUT;
use crate::secureboot::KeySetOptions;

/// File name looked up under the user config dir.
pub const CONFIG_FILE_NAME: &str = "enki.toml";

/// Terminal representation of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// The artifact tree copied verbatim to the output directory.
    #[default]
    Uki,
    /// A hybrid bootable ISO plus its checksum.
    Iso,
    /// An OCI image archive whose single layer is the artifact tree.
    Container,
}

impl FromStr for OutputKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uki" => Ok(OutputKind::Uki),
            "iso" => Ok(OutputKind::Iso),
            "container" => Ok(OutputKind::Container),
            other => bail!("invalid artifact type: {} (expected uki, iso or container)", other),
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputKind::Uki => "uki",
            OutputKind::Iso => "iso",
            OutputKind::Container => "container",
        };
        f.write_str(s)
    }
}

/// Everything a `build-uki` run needs.
#[derive(Debug, Clone)]
pub struct UkiBuildConfig {
    /// Extracted root filesystem. Never modified; the build works on a copy.
    pub rootfs: PathBuf,
    pub output_dir: PathBuf,
    pub keys_dir: PathBuf,
    pub output_kind: OutputKind,
    pub arch: Arch,
    /// Where the EFI stub and systemd-boot binaries live.
    pub support_dir: PathBuf,
    /// One extra UKI per entry, booting the base cmdline plus these args.
    pub extra_cmdlines: Vec<String>,
    /// Appended to the base cmdline of every UKI.
    pub extend_cmdline: Option<String>,
    /// `"Title: args"` entries, each a UKI with its own menu title.
    pub single_efi_cmdlines: Vec<String>,
    /// Merged into the rootfs copy before the initramfs is built.
    pub overlay_rootfs: Option<PathBuf>,
    pub initrd_compression: InitrdCompression,
    pub entry: UkiEntryOptions,
    pub loader: LoaderOptions,
    pub iso: IsoOptions,
    pub tool_timeout: Duration,
}

impl UkiBuildConfig {
    pub fn new(rootfs: PathBuf, output_dir: PathBuf, keys_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            rootfs,
            output_dir,
            keys_dir,
            output_kind: OutputKind::default(),
            arch: Arch::host()?,
            support_dir: PathBuf::from(DEFAULT_SUPPORT_DIR),
            extra_cmdlines: Vec::new(),
            extend_cmdline: None,
            single_efi_cmdlines: Vec::new(),
            overlay_rootfs: None,
            initrd_compression: InitrdCompression::default(),
            entry: UkiEntryOptions::default(),
            loader: LoaderOptions::default(),
            iso: IsoOptions::default(),
            tool_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Apply values set in the `[build_uki]` table.
    pub fn apply_file(&mut self, file: &BuildUkiToml) -> Result<()> {
        if let Some(ref arch) = file.arch {
            self.arch = Arch::parse(arch)?;
        }
        if let Some(ref kind) = file.artifact {
            self.output_kind = *kind;
        }
        if let Some(ref dir) = file.support_dir {
            self.support_dir = dir.clone();
        }
        if let Some(ref lines) = file.cmdline {
            self.extra_cmdlines = lines.clone();
        }
        if let Some(ref extend) = file.extend_cmdline {
            self.extend_cmdline = Some(extend.clone());
        }
        if let Some(ref entries) = file.single_efi_cmdline {
            self.single_efi_cmdlines = entries.clone();
        }
        if let Some(ref dir) = file.overlay_rootfs {
            self.overlay_rootfs = Some(dir.clone());
        }
        if let Some(compression) = file.initrd_compression {
            self.initrd_compression = compression;
        }
        if let Some(ref branding) = file.boot_branding {
            self.entry.boot_branding = branding.clone();
        }
        if let Some(v) = file.include_version_in_config {
            self.entry.include_version = v;
        }
        if let Some(v) = file.include_cmdline_in_config {
            self.entry.include_cmdline = v;
        }
        if let Some(mib) = file.efi_size_warn {
            self.entry.efi_size_warn_mib = mib;
        }
        if let Some(ref entry) = file.default_entry {
            self.loader.default_entry = Some(entry.clone());
        }
        if let Some(ref policy) = file.secure_boot_enroll {
            self.loader.secure_boot_enroll = policy.clone();
        }
        if let Some(ref label) = file.iso_label {
            self.iso.label = label.clone();
        }
        if let Some(ref name) = file.name {
            self.iso.name = Some(name.clone());
        }
        if let Some(ref dir) = file.overlay_iso {
            self.iso.overlay = Some(dir.clone());
        }
        if let Some(secs) = file.tool_timeout_secs {
            self.tool_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }
}

/// `enki.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub build_uki: BuildUkiToml,
    #[serde(default)]
    pub genkey: GenkeyToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildUkiToml {
    pub arch: Option<String>,
    pub artifact: Option<OutputKind>,
    pub support_dir: Option<PathBuf>,
    pub cmdline: Option<Vec<String>>,
    pub extend_cmdline: Option<String>,
    pub single_efi_cmdline: Option<Vec<String>>,
    pub overlay_rootfs: Option<PathBuf>,
    pub overlay_iso: Option<PathBuf>,
    pub initrd_compression: Option<InitrdCompression>,
    pub boot_branding: Option<String>,
    pub include_version_in_config: Option<bool>,
    pub include_cmdline_in_config: Option<bool>,
    pub efi_size_warn: Option<u64>,
    pub default_entry: Option<String>,
    pub secure_boot_enroll: Option<String>,
    pub iso_label: Option<String>,
    pub name: Option<String>,
    pub tool_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenkeyToml {
    pub output: Option<PathBuf>,
    pub expiration_in_days: Option<u32>,
    pub skip_microsoft_certs: Option<bool>,
    pub custom_cert_dir: Option<PathBuf>,
    pub vendor_cert_dir: Option<PathBuf>,
    pub tool_timeout_secs: Option<u64>,
}

impl GenkeyToml {
    /// Apply values set in the `[genkey]` table.
    pub fn apply(&self, options: &mut KeySetOptions) {
        if let Some(days) = self.expiration_in_days {
            options.expiration_days = days;
        }
        if let Some(skip) = self.skip_microsoft_certs {
            options.include_vendor_certs = !skip;
        }
        if let Some(ref dir) = self.custom_cert_dir {
            options.custom_cert_dir = Some(dir.clone());
        }
        if self.vendor_cert_dir.is_some() {
            options.vendor_cert_dir = self.vendor_cert_dir.clone();
        }
        if let Some(secs) = self.tool_timeout_secs {
            options.tool_timeout = Duration::from_secs(secs);
        }
    }
}

/// Load `explicit`, or the per-user config file when it exists.
///
/// A missing explicit path is an error; a missing default file is not.
pub fn load_config_file(explicit: Option<&Path>) -> Result<ConfigFile> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match dirs::config_dir().map(|d| d.join("enki").join(CONFIG_FILE_NAME)) {
            Some(path) if path.is_file() => path,
            _ => return Ok(ConfigFile::default()),
        },
    };
    parse_config_file(&path)
}

fn parse_config_file(path: &Path) -> Result<ConfigFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing config '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_output_kind_parse() {
        assert_eq!("iso".parse::<OutputKind>().unwrap(), OutputKind::Iso);
        assert_eq!("uki".parse::<OutputKind>().unwrap(), OutputKind::Uki);
        assert!("raw".parse::<OutputKind>().is_err());
        assert_eq!(OutputKind::Container.to_string(), "container");
    }

    #[test]
    fn test_parse_config_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("enki.toml");
        fs::write(
            &path,
            r#"
[build_uki]
arch = "arm64"
artifact = "iso"
boot_branding = "Acme OS"
secure_boot_enroll = "manual"
include_version_in_config = true
efi_size_warn = 512
cmdline = ["rd.cos.disable"]
initrd_compression = "gzip"

[genkey]
expiration_in_days = 730
skip_microsoft_certs = true
"#,
        )
        .unwrap();

        let file = load_config_file(Some(&path)).unwrap();
        let mut config =
            UkiBuildConfig::new("/rootfs".into(), "/out".into(), "/keys".into()).unwrap();
        config.apply_file(&file.build_uki).unwrap();

        assert_eq!(config.arch, Arch::Arm64);
        assert_eq!(config.output_kind, OutputKind::Iso);
        assert_eq!(config.entry.boot_branding, "Acme OS");
        assert!(config.entry.include_version);
        assert!(!config.entry.include_cmdline);
        assert_eq!(config.entry.efi_size_warn_mib, 512);
        assert_eq!(config.loader.secure_boot_enroll, "manual");
        assert_eq!(config.extra_cmdlines, vec!["rd.cos.disable".to_string()]);
        assert_eq!(config.initrd_compression, InitrdCompression::Gzip);

        let mut options = KeySetOptions::new("mykey");
        file.genkey.apply(&mut options);
        assert_eq!(options.expiration_days, 730);
        assert!(!options.include_vendor_certs);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("enki.toml");
        fs::write(&path, "[build_uki]\nbranding = \"typo\"\n").unwrap();
        assert!(load_config_file(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(load_config_file(Some(Path::new("/nonexistent/enki.toml"))).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = UkiBuildConfig::new("/r".into(), "/o".into(), "/k".into()).unwrap();
        assert_eq!(config.output_kind, OutputKind::Uki);
        assert_eq!(config.loader.secure_boot_enroll, "if-safe");
        assert_eq!(config.entry.efi_size_warn_mib, 1024);
        assert_eq!(config.support_dir, PathBuf::from("/usr/kairos"));
        assert_eq!(config.tool_timeout, DEFAULT_TIMEOUT);
    }
}

//! Host binary implementations of the tool traits.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ImageFormatter, IsoMaster, IsoRequest, Signer, SigningKeys, UkiComposer, UkiRequest};
use crate::cancel::Cancellation;
use crate::config::OutputKind;
use crate::process::{Cmd, DEFAULT_TIMEOUT};

/// Default location of the ukify script shipped by systemd.
pub const UKIFY_PATH: &str = "/usr/lib/systemd/ukify";

/// Tools needed to produce the UKI tree itself.
pub const UKI_TOOLS: &[(&str, &str)] = &[(UKIFY_PATH, "systemd-ukify"), ("sbsign", "sbsigntool")];

/// Additional tools needed to wrap the tree into an ISO.
pub const ISO_TOOLS: &[(&str, &str)] = &[
    ("dd", "coreutils"),
    ("mkfs.msdos", "dosfstools"),
    ("mmd", "mtools"),
    ("mcopy", "mtools"),
    ("xorriso", "xorriso"),
];

/// Host tools `kind` needs, as (command, package) pairs.
pub fn required_tools(kind: OutputKind) -> Vec<(&'static str, &'static str)> {
    let mut tools = UKI_TOOLS.to_vec();
    if kind == OutputKind::Iso {
        tools.extend_from_slice(ISO_TOOLS);
    }
    tools
}

/// Runs the real binaries through [`Cmd`].
#[derive(Debug, Clone)]
pub struct HostTools {
    ukify: PathBuf,
    timeout: Duration,
    cancel: Cancellation,
}

impl Default for HostTools {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, Cancellation::new())
    }
}

impl HostTools {
    pub fn new(timeout: Duration, cancel: Cancellation) -> Self {
        Self {
            ukify: PathBuf::from(UKIFY_PATH),
            timeout,
            cancel,
        }
    }

    pub fn with_ukify(mut self, path: impl Into<PathBuf>) -> Self {
        self.ukify = path.into();
        self
    }

    fn cmd(&self, program: impl AsRef<str>) -> Cmd {
        Cmd::new(program).timeout(self.timeout).cancel_on(&self.cancel)
    }
}

impl UkiComposer for HostTools {
    fn compose(&self, request: &UkiRequest<'_>) -> Result<()> {
        self.cmd(self.ukify.to_string_lossy())
            .arg("build")
            .arg("--linux")
            .arg_path(request.kernel)
            .arg("--initrd")
            .arg_path(request.initrd)
            .arg("--cmdline")
            .arg(request.cmdline)
            .arg("--os-release")
            .arg(format!("@{}", request.os_release.display()))
            .arg("--stub")
            .arg_path(request.stub)
            .arg("--secureboot-private-key")
            .arg_path(&request.keys.key)
            .arg("--secureboot-certificate")
            .arg_path(&request.keys.cert)
            .arg("--pcr-private-key")
            .arg_path(&request.keys.pcr_key)
            .arg("--measure")
            .arg("--output")
            .arg_path(request.output)
            .error_msg(format!("building UKI {}", request.output.display()))
            .run()?;
        Ok(())
    }
}

impl Signer for HostTools {
    fn sign(&self, keys: &SigningKeys, input: &Path, output: &Path) -> Result<()> {
        self.cmd("sbsign")
            .arg("--key")
            .arg_path(&keys.key)
            .arg("--cert")
            .arg_path(&keys.cert)
            .arg("--output")
            .arg_path(output)
            .arg_path(input)
            .error_msg(format!("signing {}", input.display()))
            .run()?;
        Ok(())
    }
}

impl ImageFormatter for HostTools {
    fn create(&self, image: &Path, size_mib: u64) -> Result<()> {
        self.cmd("dd")
            .arg("if=/dev/zero")
            .arg(format!("of={}", image.display()))
            .arg("bs=1M")
            .arg(format!("count={}", size_mib))
            .error_msg("allocating EFI image")
            .run()?;

        self.cmd("mkfs.msdos")
            .args(["-F", "32"])
            .arg_path(image)
            .error_msg("formatting EFI image as FAT32")
            .run()?;
        Ok(())
    }

    fn mkdir(&self, image: &Path, dir: &str) -> Result<()> {
        self.cmd("mmd")
            .arg("-i")
            .arg_path(image)
            .arg(format!("::{}", dir))
            .error_msg(format!("creating ::{} in EFI image", dir))
            .run()?;
        Ok(())
    }

    fn copy(&self, image: &Path, src: &Path, dir: &str) -> Result<()> {
        let name = src
            .file_name()
            .with_context(|| format!("{} has no file name", src.display()))?
            .to_string_lossy();
        self.cmd("mcopy")
            .arg("-i")
            .arg_path(image)
            .arg_path(src)
            .arg(format!("::{}/{}", dir, name))
            .error_msg(format!("copying {} into EFI image", src.display()))
            .run()?;
        Ok(())
    }
}

impl IsoMaster for HostTools {
    fn master(&self, request: &IsoRequest<'_>) -> Result<()> {
        let mut cmd = self
            .cmd("xorriso")
            .args(["-as", "mkisofs"])
            .args(["-V", request.label])
            .args(["-J", "-joliet-long", "-r"]);

        if let Some(ref bios) = request.bios {
            cmd = cmd
                .args(["-b", bios.image.as_str(), "-c", bios.catalog.as_str()])
                .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table"])
                .arg("-isohybrid-mbr")
                .arg_path(&bios.mbr)
                .arg("-eltorito-alt-boot");
        }

        cmd = cmd.args(["-e", request.efi_image, "-no-emul-boot"]);
        if request.bios.is_some() {
            cmd = cmd.arg("-isohybrid-gpt-basdat");
        }

        cmd.arg("-o")
            .arg_path(request.output)
            .arg_path(request.staging)
            .error_msg("mastering ISO")
            .run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_tools_per_kind() {
        let uki = required_tools(OutputKind::Uki);
        assert!(uki.iter().any(|(t, _)| *t == "sbsign"));
        assert!(!uki.iter().any(|(t, _)| *t == "xorriso"));

        let iso = required_tools(OutputKind::Iso);
        assert!(iso.iter().any(|(t, _)| *t == "xorriso"));
        assert!(iso.iter().any(|(t, _)| *t == "mkfs.msdos"));

        assert_eq!(required_tools(OutputKind::Container), uki);
    }

    #[test]
    fn test_failed_tool_reports_context() {
        let tools = HostTools::default();
        let keys = SigningKeys::in_dir(Path::new("/nonexistent"));
        // sbsign may be absent; either way the call must fail, not panic.
        let result = tools.sign(&keys, Path::new("/nonexistent/in"), Path::new("/nonexistent/out"));
        assert!(result.is_err());
    }
}

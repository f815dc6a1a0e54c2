//! Kernel command-line variants and the file names derived from them.
//!
//! Every UKI built for an ISO shares one base cmdline. The default entry adds
//! the `install-mode` sentinel; extra entries add their own arguments. Each
//! variant gets a stable file stem so that `<stem>.efi` and `<stem>.conf`
//! always pair up:
//!
//! ```text
//! <base> install-mode              -> artifact
//! <base> rd.cos.disable            -> artifact_rd.cos.disable
//! <base> rd.immucore.debug nomodeset -> artifact_rd.immucore.debug_nomodeset
//! ```

use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// Arguments every UKI boots with.
pub const BASE_CMDLINE: &str = "console=ttyS0 console=tty1 net.ifnames=1 rd.immucore.oemlabel=COS_OEM rd.immucore.debug rd.immucore.oemtimeout=2 rd.immucore.uki selinux=0";

/// Marks the default entry of install media.
pub const INSTALL_MODE: &str = "install-mode";

/// Stem of the default entry; other entries extend it.
pub const ARTIFACT_BASE_NAME: &str = "artifact";

/// One UKI to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdlineVariant {
    pub title: String,
    pub cmdline: String,
    pub file_stem: String,
}

impl CmdlineVariant {
    pub fn efi_name(&self) -> String {
        format!("{}.efi", self.file_stem)
    }

    pub fn conf_name(&self) -> String {
        format!("{}.conf", self.file_stem)
    }
}

/// The base cmdline in effect for a build, plus the derivations that depend on it.
#[derive(Debug, Clone)]
pub struct CmdlineSet {
    base: String,
}

impl Default for CmdlineSet {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CmdlineSet {
    /// `extend` is appended to the base cmdline of every variant.
    pub fn new(extend: Option<&str>) -> Self {
        let base = match extend.map(str::trim).filter(|e| !e.is_empty()) {
            Some(extend) => format!("{} {}", BASE_CMDLINE, extend),
            None => BASE_CMDLINE.to_string(),
        };
        Self { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Cmdline of the default install entry.
    pub fn install_cmdline(&self) -> String {
        format!("{} {}", self.base, INSTALL_MODE)
    }

    /// The part of `cmdline` added on top of the base, without the sentinel.
    ///
    /// This is what boot menus may show; the base itself stays internal.
    pub fn extra(&self, cmdline: &str) -> String {
        let extra = cmdline.strip_prefix(self.base.as_str()).unwrap_or(cmdline).trim();
        match extra.strip_suffix(INSTALL_MODE) {
            Some(rest) if rest.is_empty() || rest.ends_with(' ') => rest.trim().to_string(),
            _ => extra.to_string(),
        }
    }

    /// Deterministic file stem for `cmdline`.
    pub fn file_stem(&self, cmdline: &str) -> String {
        let clean = self.extra(cmdline).replace(' ', "_");
        let name = format!("{}_{}", ARTIFACT_BASE_NAME, clean);
        name.trim_end_matches('_').to_string()
    }

    pub fn variant(&self, title: &str, cmdline: String) -> CmdlineVariant {
        CmdlineVariant {
            title: title.to_string(),
            file_stem: self.file_stem(&cmdline),
            cmdline,
        }
    }

    /// Every variant to build: the install entry first, then one per `extra`
    /// cmdline, then one per `"Title: args"` single entry.
    ///
    /// Requests that repeat an existing cmdline collapse into one variant;
    /// distinct cmdlines that map to the same file stem are rejected.
    pub fn variants(
        &self,
        title: &str,
        extra: &[String],
        single_entries: &[String],
    ) -> Result<Vec<CmdlineVariant>> {
        let mut variants = vec![self.variant(title, self.install_cmdline())];

        for line in extra {
            variants.push(self.variant(title, format!("{} {}", self.base, line.trim())));
        }

        for entry in single_entries {
            let (entry_title, args) = match entry.split_once(':') {
                Some((t, a)) if !t.trim().is_empty() => (t.trim(), a.trim()),
                _ => (title, entry.trim()),
            };
            variants.push(self.variant(entry_title, format!("{} {}", self.base, args)));
        }

        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        let mut unique = Vec::with_capacity(variants.len());
        for variant in variants {
            match seen.get(&variant.file_stem) {
                Some(cmdline) if *cmdline == variant.cmdline => continue,
                Some(cmdline) => bail!(
                    "cmdlines '{}' and '{}' both map to '{}'",
                    cmdline,
                    variant.cmdline,
                    variant.file_stem
                ),
                None => {
                    seen.insert(variant.file_stem.clone(), variant.cmdline.clone());
                    unique.push(variant);
                }
            }
        }
        Ok(unique)
    }
}

//! Vendor certificates appended to `KEK` and `db`.
//!
//! Most hardware ships option ROMs and boot loaders signed by Microsoft, so a
//! key set that drops Microsoft's KEK and db certificates can leave a
//! machine unable to boot. They are read from `<vendor dir>/<role>/*` as DER.
//!
//! Without an explicit directory the first installed one from
//! [`vendor_cert_dirs`] is used.

use anyhow::{bail, Context, Result};
use der::Decode;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use x509_cert::Certificate;

use super::esl::{SignatureDatabase, SignatureEntry};
use super::Role;
use crate::error::BuildError;

/// Owner GUID Microsoft enrolls its certificates under.
pub const MICROSOFT_OWNER: Uuid = Uuid::from_u128(0x77fa9abd_0359_4d32_bd60_28f4e78f784b);

/// Where packages install the Microsoft certificates.
pub const DEFAULT_VENDOR_CERT_DIR: &str = "/usr/share/enki/vendor-certs/microsoft";

const VENDOR_SUBDIR: &str = "enki/vendor-certs/microsoft";

/// Install locations searched for the vendor certificates, most specific first.
///
/// `ENKI_VENDOR_CERT_DIR` set at compile time lets a package bake in its prefix.
pub fn vendor_cert_dirs() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = option_env!("ENKI_VENDOR_CERT_DIR") {
        candidates.push(PathBuf::from(dir));
    }
    if let Some(data) = dirs::data_dir() {
        candidates.push(data.join(VENDOR_SUBDIR));
    }
    // Relocatable installs: <prefix>/bin/enki next to <prefix>/share.
    if let Some(prefix) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent()?.parent().map(Path::to_path_buf))
    {
        candidates.push(prefix.join("share").join(VENDOR_SUBDIR));
    }
    candidates.push(PathBuf::from("/usr/local/share").join(VENDOR_SUBDIR));
    candidates.push(PathBuf::from(DEFAULT_VENDOR_CERT_DIR));
    candidates
}

/// First of `candidates` holding both a `KEK` and a `db` directory.
pub fn find_vendor_cert_dir(candidates: &[PathBuf]) -> Result<PathBuf> {
    let found = candidates
        .iter()
        .find(|dir| [Role::Kek, Role::Db].iter().all(|r| dir.join(r.name()).is_dir()));
    match found {
        Some(dir) => {
            log::debug!("[genkey] vendor certificates from {}", dir.display());
            Ok(dir.clone())
        }
        None => bail!(
            "Microsoft certificates not found (searched {}); pass --vendor-cert-dir, \
             or --skip-microsoft-certs-I-KNOW-WHAT-IM-DOING to leave them out",
            candidates
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Every certificate in `<dir>/<role>`, in file name order.
pub fn load_vendor_certs(dir: &Path, role: Role) -> Result<SignatureDatabase> {
    let role_dir = dir.join(role.name());
    if !role_dir.is_dir() {
        return Err(BuildError::MissingInput { path: role_dir }.into());
    }

    let mut files: Vec<_> = fs::read_dir(&role_dir)
        .with_context(|| format!("reading {}", role_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut db = SignatureDatabase::new();
    for path in files {
        let der = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        Certificate::from_der(&der)
            .with_context(|| format!("{} is not a DER X.509 certificate", path.display()))?;
        db.push(SignatureEntry::x509(MICROSOFT_OWNER, der));
    }

    if db.is_empty() {
        bail!("no vendor certificates found in {}", role_dir.display());
    }
    Ok(db)
}

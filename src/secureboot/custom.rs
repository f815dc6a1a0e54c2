//! Custom certificates exported from firmware.
//!
//! Operators that want to keep OEM certificates enrolled export the `db`
//! and `KEK` variables from their machine (e.g. from efivarfs) into a
//! directory. The X.509 entries found there are converted to individual DER
//! files and appended to the generated `KEK` and `db` databases.

use anyhow::{Context, Result};
use der::Decode;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use x509_cert::Certificate;

use super::esl::{type_name, SignatureDatabase, SignatureEntry};
use super::Role;
use crate::error::BuildError;

/// Roles read from a custom certificate directory.
pub const CUSTOM_ROLES: [Role; 2] = [Role::Db, Role::Kek];

/// Fail unless `dir` holds a `db` and a `KEK` export.
pub fn check_custom_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(BuildError::MissingInput {
            path: dir.to_path_buf(),
        }
        .into());
    }
    for role in CUSTOM_ROLES {
        let path = dir.join(role.name());
        if !path.is_file() {
            return Err(BuildError::MissingInput { path }.into());
        }
    }
    Ok(())
}

/// Write every X.509 entry of the exports in `dir` as
/// `<scratch>/custom/<role>/<role><serial>`.
pub fn convert_custom_certs(dir: &Path, scratch: &Path) -> Result<()> {
    check_custom_dir(dir)?;

    for role in CUSTOM_ROLES {
        let path = dir.join(role.name());
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let db = SignatureDatabase::parse_variable(&bytes)
            .with_context(|| format!("parsing signature database {}", path.display()))?;

        info!("[genkey] converting custom certs ({})", role.name());
        let out_dir = role_dir(scratch, role);
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("creating {}", out_dir.display()))?;

        for entry in db.entries() {
            info!("[genkey]   owner {}", entry.owner);
            if !entry.is_x509() {
                warn!(
                    "skipping {} entry in {}: only X.509 certificates are supported",
                    type_name(&entry.sig_type),
                    path.display()
                );
                continue;
            }
            let cert = match Certificate::from_der(&entry.data) {
                Ok(cert) => cert,
                Err(err) => {
                    warn!("skipping unparseable certificate in {}: {}", path.display(), err);
                    continue;
                }
            };
            let serial = decimal(cert.tbs_certificate.serial_number.as_bytes());
            let out = out_dir.join(format!("{}{}", role.name(), serial));
            fs::write(&out, &entry.data).with_context(|| format!("writing {}", out.display()))?;
        }
    }
    Ok(())
}

/// Certificates converted for `role`, owned by `owner`, in file name order.
pub fn load_custom_certs(scratch: &Path, role: Role, owner: Uuid) -> Result<SignatureDatabase> {
    let dir = role_dir(scratch, role);
    let mut db = SignatureDatabase::new();
    if !dir.is_dir() {
        return Ok(db);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(&dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    files.sort();

    for path in files {
        let der = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        db.push(SignatureEntry::x509(owner, der));
    }
    Ok(db)
}

fn role_dir(scratch: &Path, role: Role) -> PathBuf {
    scratch.join("custom").join(role.name())
}

/// Big-endian unsigned integer as a decimal string.
fn decimal(bytes: &[u8]) -> String {
    let mut digits = bytes.to_vec();
    let mut out = Vec::new();
    while digits.iter().any(|b| *b != 0) {
        let mut rem = 0u32;
        for byte in digits.iter_mut() {
            let acc = (rem << 8) | *byte as u32;
            *byte = (acc / 10) as u8;
            rem = acc % 10;
        }
        out.push(b'0' + rem as u8);
    }
    if out.is_empty() {
        return "0".to_string();
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{build_error, BuildError};
    use crate::secureboot::esl::CERT_SHA256;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
    use tempfile::TempDir;

    fn cert_der(cn: &str, serial: u64) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(serial));
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn export(dir: &Path, role: Role, entries: Vec<SignatureEntry>) {
        let mut db = SignatureDatabase::new();
        for e in entries {
            db.push(e);
        }
        let mut bytes = vec![0x27, 0, 0, 0];
        bytes.extend(db.to_bytes());
        fs::write(dir.join(role.name()), bytes).unwrap();
    }

    #[test]
    fn test_decimal() {
        assert_eq!(decimal(&[]), "0");
        assert_eq!(decimal(&[0x00]), "0");
        assert_eq!(decimal(&[0x01, 0x00]), "256");
        assert_eq!(decimal(&[0x12, 0x34, 0x56, 0x78, 0x9a]), "78187493530");
    }

    #[test]
    fn test_convert_and_load() {
        let temp = TempDir::new().unwrap();
        let custom = temp.path().join("custom-in");
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(&custom).unwrap();

        let oem_owner = Uuid::from_u128(0x1234);
        export(
            &custom,
            Role::Db,
            vec![
                SignatureEntry::x509(oem_owner, cert_der("ASUSTeK MotherBoard SW Key Certificate", 4660)),
                SignatureEntry {
                    sig_type: CERT_SHA256,
                    owner: oem_owner,
                    data: vec![0xAB; 32],
                },
            ],
        );
        export(
            &custom,
            Role::Kek,
            vec![SignatureEntry::x509(oem_owner, cert_der("ASUSTeK MotherBoard KEK Certificate", 7))],
        );

        convert_custom_certs(&custom, &scratch).unwrap();
        assert!(scratch.join("custom/db/db4660").is_file());
        assert!(scratch.join("custom/KEK/KEK7").is_file());

        let owner = Uuid::from_u128(0x99);
        let db = load_custom_certs(&scratch, Role::Db, owner).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.entries()[0].owner, owner);
        assert!(load_custom_certs(&scratch, Role::Pk, owner).unwrap().is_empty());
    }

    #[test]
    fn test_missing_kek_export() {
        let temp = TempDir::new().unwrap();
        export(temp.path(), Role::Db, vec![]);
        let err = check_custom_dir(temp.path()).unwrap_err();
        assert!(matches!(
            build_error(&err),
            Some(BuildError::MissingInput { path }) if path.ends_with("KEK")
        ));
    }
}

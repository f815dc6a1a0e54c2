//! Secure boot key sets.
//!
//! `generate_key_set` creates the PK → KEK → db hierarchy a UKI build signs
//! against and firmware enrolls at first boot. For each role it writes:
//!
//! | file           | contents                                   |
//! |----------------|--------------------------------------------|
//! | `<role>.key`   | RSA-2048 private key                       |
//! | `<role>.pem`   | self-signed certificate, `CN=<name>`       |
//! | `<role>.der`   | same certificate, DER                      |
//! | `<role>.esl`   | signature database                         |
//! | `<role>.auth`  | database signed as an authenticated var    |
//!
//! plus `tpm2-pcr-private.pem` for signing PCR policies. Everything is
//! generated in a staging directory and only moved into place once every
//! file exists.

pub mod auth;
pub mod authority;
pub mod custom;
pub mod esl;
pub mod vendor;

use anyhow::{Context, Result};
use log::info;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::artifact::filesystem::move_dir_contents;
use crate::cancel::Cancellation;
use crate::cleanup::CleanupStack;
use crate::process::DEFAULT_TIMEOUT;
use auth::{EfiTime, EFI_GLOBAL_VARIABLE, IMAGE_SECURITY_DATABASE};
use authority::{CertAuthority, CertRequest};
use esl::{SignatureDatabase, SignatureEntry};

/// File name of the PCR policy signing key.
pub const PCR_KEY_FILE: &str = "tpm2-pcr-private.pem";

/// A secure boot variable role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Pk,
    Kek,
    Db,
}

impl Role {
    /// Roles in generation order.
    pub const ALL: [Role; 3] = [Role::Pk, Role::Kek, Role::Db];

    /// Variable name, also the file stem.
    pub fn name(self) -> &'static str {
        match self {
            Role::Pk => "PK",
            Role::Kek => "KEK",
            Role::Db => "db",
        }
    }

    /// Vendor GUID of the variable.
    pub fn vendor_guid(self) -> Uuid {
        match self {
            Role::Pk | Role::Kek => EFI_GLOBAL_VARIABLE,
            Role::Db => IMAGE_SECURITY_DATABASE,
        }
    }

    /// Whether vendor and custom certificates are appended.
    pub fn accepts_extra_certs(self) -> bool {
        self != Role::Pk
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options for `genkey`.
#[derive(Debug, Clone)]
pub struct KeySetOptions {
    /// Common name of every certificate.
    pub name: String,
    pub expiration_days: u32,
    pub include_vendor_certs: bool,
    /// Overrides the search of [`vendor::vendor_cert_dirs`].
    pub vendor_cert_dir: Option<PathBuf>,
    /// Directory with `db` and `KEK` firmware exports.
    pub custom_cert_dir: Option<PathBuf>,
    pub tool_timeout: Duration,
}

impl KeySetOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expiration_days: 365,
            include_vendor_certs: true,
            vendor_cert_dir: None,
            custom_cert_dir: None,
            tool_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Paths of one role's files.
#[derive(Debug, Clone)]
pub struct RoleFiles {
    pub role: Role,
    pub key: PathBuf,
    pub pem: PathBuf,
    pub der: PathBuf,
    pub esl: PathBuf,
    pub auth: PathBuf,
}

impl RoleFiles {
    pub fn in_dir(dir: &Path, role: Role) -> Self {
        let file = |ext: &str| dir.join(format!("{}.{}", role.name(), ext));
        Self {
            role,
            key: file("key"),
            pem: file("pem"),
            der: file("der"),
            esl: file("esl"),
            auth: file("auth"),
        }
    }
}

/// A generated key set.
#[derive(Debug, Clone)]
pub struct KeySet {
    pub dir: PathBuf,
    /// Owner GUID of every locally generated signature.
    pub owner: Uuid,
    pub roles: Vec<RoleFiles>,
    pub pcr_key: PathBuf,
}

impl KeySet {
    pub fn role(&self, role: Role) -> Option<&RoleFiles> {
        self.roles.iter().find(|r| r.role == role)
    }
}

/// Generate a full key set into `output_dir`.
pub fn generate_key_set(
    options: &KeySetOptions,
    output_dir: &Path,
    authority: &dyn CertAuthority,
    cancel: &Cancellation,
) -> Result<KeySet> {
    let mut cleanup = CleanupStack::new();
    let result = generate_inner(options, output_dir, authority, cancel, &mut cleanup);
    cleanup.finish(result)
}

fn generate_inner(
    options: &KeySetOptions,
    output_dir: &Path,
    authority: &dyn CertAuthority,
    cancel: &Cancellation,
    cleanup: &mut CleanupStack,
) -> Result<KeySet> {
    // Inputs are validated before any key exists.
    let custom_scratch = match options.custom_cert_dir {
        Some(ref dir) => {
            custom::check_custom_dir(dir)?;
            let scratch = cleanup.temp_dir("enki-custom-certs-")?;
            custom::convert_custom_certs(dir, &scratch)?;
            Some(scratch)
        }
        None => None,
    };

    let vendor_dir = match (options.include_vendor_certs, &options.vendor_cert_dir) {
        (false, _) => None,
        (true, Some(dir)) => Some(dir.clone()),
        (true, None) => Some(vendor::find_vendor_cert_dir(&vendor::vendor_cert_dirs())?),
    };
    let mut vendor_dbs = Vec::new();
    for role in Role::ALL.into_iter().filter(|r| r.accepts_extra_certs()) {
        let db = match vendor_dir {
            Some(ref dir) => vendor::load_vendor_certs(dir, role)?,
            None => SignatureDatabase::new(),
        };
        vendor_dbs.push((role, db));
    }
    if !options.include_vendor_certs {
        log::warn!("vendor certificates are not included in KEK and db; some hardware may fail to boot");
    }

    if !output_dir.exists() {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        fs::set_permissions(output_dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("restricting {}", output_dir.display()))?;
    }

    let staging = tempfile::Builder::new()
        .prefix(".enki-keys-")
        .tempdir_in(output_dir)
        .context("creating key staging dir")?
        .into_path();
    cleanup.remove_on_exit(&staging);

    let owner = Uuid::new_v4();
    info!("[genkey] owner GUID {}", owner);

    for role in Role::ALL {
        cancel.checkpoint()?;
        info!("[genkey] generating {}", role);
        let files = RoleFiles::in_dir(&staging, role);
        authority.create_certificate(&CertRequest {
            common_name: options.name.clone(),
            days: options.expiration_days,
            key: files.key.clone(),
            pem: files.pem.clone(),
            der: files.der.clone(),
        })?;

        let der = fs::read(&files.der)
            .with_context(|| format!("reading {}", files.der.display()))?;
        let mut db = SignatureDatabase::new();
        db.push(SignatureEntry::x509(owner, der));

        if let Some((_, vendor_db)) = vendor_dbs.iter().find(|(r, _)| *r == role) {
            db.append(vendor_db.clone());
        }
        if role.accepts_extra_certs() {
            if let Some(ref scratch) = custom_scratch {
                db.append(custom::load_custom_certs(scratch, role, owner)?);
            }
        }

        let esl = db.to_bytes();
        let signed = auth::sign_variable(
            role.name(),
            role.vendor_guid(),
            EfiTime::now(),
            &esl,
            authority,
            &files.key,
            &files.pem,
        )?;
        fs::write(&files.auth, signed)
            .with_context(|| format!("writing {}", files.auth.display()))?;
        fs::write(&files.esl, &esl).with_context(|| format!("writing {}", files.esl.display()))?;
        info!("[genkey] {} signed with {} entries", role, db.len());
    }

    cancel.checkpoint()?;
    info!("[genkey] generating PCR policy key");
    authority.create_private_key(&staging.join(PCR_KEY_FILE))?;

    move_dir_contents(&staging, output_dir)?;
    info!("[genkey] key set written to {}", output_dir.display());

    Ok(KeySet {
        dir: output_dir.to_path_buf(),
        owner,
        roles: Role::ALL
            .into_iter()
            .map(|r| RoleFiles::in_dir(output_dir, r))
            .collect(),
        pcr_key: output_dir.join(PCR_KEY_FILE),
    })
}

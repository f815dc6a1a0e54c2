//! Key, certificate and signature generation.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::Cancellation;
use crate::process::{Cmd, DEFAULT_TIMEOUT};

/// Host tools the openssl authority needs.
pub const AUTHORITY_TOOLS: &[(&str, &str)] = &[("openssl", "openssl")];

/// A self-signed certificate to create.
#[derive(Debug, Clone)]
pub struct CertRequest {
    pub common_name: String,
    pub days: u32,
    /// Unencrypted RSA private key (PEM).
    pub key: PathBuf,
    pub pem: PathBuf,
    pub der: PathBuf,
}

pub trait CertAuthority {
    /// RSA-2048 key plus a self-signed certificate valid from now for
    /// `request.days` days, written as PEM and DER.
    fn create_certificate(&self, request: &CertRequest) -> Result<()>;

    /// Unencrypted RSA-2048 private key (PEM).
    fn create_private_key(&self, path: &Path) -> Result<()>;

    /// Detached DER PKCS#7 SignedData over `data`, SHA-256, no signed attributes.
    fn sign_detached(&self, data: &[u8], key: &Path, cert: &Path) -> Result<Vec<u8>>;
}

/// [`CertAuthority`] backed by the `openssl` binary.
#[derive(Debug, Clone)]
pub struct OpensslAuthority {
    timeout: Duration,
    cancel: Cancellation,
}

impl Default for OpensslAuthority {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, Cancellation::new())
    }
}

impl OpensslAuthority {
    pub fn new(timeout: Duration, cancel: Cancellation) -> Self {
        Self { timeout, cancel }
    }

    fn openssl(&self) -> Cmd {
        Cmd::new("openssl").timeout(self.timeout).cancel_on(&self.cancel)
    }
}

impl CertAuthority for OpensslAuthority {
    fn create_certificate(&self, request: &CertRequest) -> Result<()> {
        self.openssl()
            .args(["req", "-new", "-x509", "-newkey", "rsa:2048", "-nodes", "-sha256"])
            .arg("-subj")
            .arg(format!("/CN={}/", request.common_name))
            .arg("-keyout")
            .arg_path(&request.key)
            .arg("-out")
            .arg_path(&request.pem)
            .arg("-days")
            .arg(request.days.to_string())
            .error_msg(format!("generating certificate for {}", request.common_name))
            .run()?;

        self.openssl()
            .args(["x509", "-outform", "DER", "-in"])
            .arg_path(&request.pem)
            .arg("-out")
            .arg_path(&request.der)
            .error_msg(format!("converting {} to DER", request.pem.display()))
            .run()?;
        Ok(())
    }

    fn create_private_key(&self, path: &Path) -> Result<()> {
        self.openssl()
            .args(["genrsa", "-out"])
            .arg_path(path)
            .arg("2048")
            .error_msg(format!("generating {}", path.display()))
            .run()?;
        Ok(())
    }

    fn sign_detached(&self, data: &[u8], key: &Path, cert: &Path) -> Result<Vec<u8>> {
        let scratch = tempfile::Builder::new()
            .prefix("enki-sign-")
            .tempdir()
            .context("creating signing scratch dir")?;
        let input = scratch.path().join("payload");
        let output = scratch.path().join("payload.p7");
        fs::write(&input, data).context("writing signing payload")?;

        self.openssl()
            .args(["smime", "-sign", "-binary", "-noattr", "-md", "sha256", "-outform", "DER"])
            .arg("-in")
            .arg_path(&input)
            .arg("-signer")
            .arg_path(cert)
            .arg("-inkey")
            .arg_path(key)
            .arg("-out")
            .arg_path(&output)
            .error_msg("signing authenticated variable")
            .run()?;

        fs::read(&output).context("reading PKCS#7 signature")
    }
}

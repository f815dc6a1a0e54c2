//! Fakes and fixtures shared by the integration tests.

#![allow(dead_code)]

use anyhow::Result;
use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

use enki::arch::{Arch, SupportFiles};
use enki::preflight::REQUIRED_KEY_FILES;
use enki::secureboot::authority::{CertAuthority, CertRequest};
use enki::tools::{
    ImageFormatter, IsoMaster, IsoRequest, Signer, SigningKeys, Toolchain, UkiComposer, UkiRequest,
};

/// Calls observed by the fake tools.
#[derive(Debug, Default)]
pub struct Calls {
    pub cmdlines: Vec<String>,
    pub initrds: Vec<PathBuf>,
    pub signed: Vec<PathBuf>,
    pub esp_size_mib: Option<u64>,
    pub iso_label: Option<String>,
    pub iso_bios: Option<bool>,
}

pub type SharedCalls = Rc<RefCell<Calls>>;

/// Writes the cmdline as the UKI body.
pub struct FakeComposer(pub SharedCalls);

impl UkiComposer for FakeComposer {
    fn compose(&self, request: &UkiRequest<'_>) -> Result<()> {
        let mut calls = self.0.borrow_mut();
        calls.cmdlines.push(request.cmdline.to_string());
        calls.initrds.push(request.initrd.to_path_buf());
        fs::write(request.output, format!("UKI {}\n", request.cmdline))?;
        Ok(())
    }
}

pub struct FakeSigner(pub SharedCalls);

impl Signer for FakeSigner {
    fn sign(&self, _keys: &SigningKeys, input: &Path, output: &Path) -> Result<()> {
        self.0.borrow_mut().signed.push(input.to_path_buf());
        fs::copy(input, output)?;
        Ok(())
    }
}

/// Keeps the "image" as a text listing of what was put in it.
pub struct FakeFormatter(pub SharedCalls);

impl FakeFormatter {
    fn append(image: &Path, line: String) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(image)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

impl ImageFormatter for FakeFormatter {
    fn create(&self, image: &Path, size_mib: u64) -> Result<()> {
        self.0.borrow_mut().esp_size_mib = Some(size_mib);
        fs::write(image, format!("fat32 {}\n", size_mib))?;
        Ok(())
    }

    fn mkdir(&self, image: &Path, dir: &str) -> Result<()> {
        Self::append(image, format!("dir {}", dir))
    }

    fn copy(&self, image: &Path, src: &Path, dir: &str) -> Result<()> {
        let name = src.file_name().unwrap().to_string_lossy().into_owned();
        Self::append(image, format!("file {}/{}", dir, name))
    }
}

/// Writes the ESP listing as the ISO body.
pub struct FakeIsoMaster(pub SharedCalls);

impl IsoMaster for FakeIsoMaster {
    fn master(&self, request: &IsoRequest<'_>) -> Result<()> {
        let mut calls = self.0.borrow_mut();
        calls.iso_label = Some(request.label.to_string());
        calls.iso_bios = Some(request.bios.is_some());
        let esp = fs::read_to_string(request.staging.join(request.efi_image))?;
        fs::write(request.output, format!("ISO {}\n{}", request.label, esp))?;
        Ok(())
    }
}

pub fn fake_toolchain() -> (Toolchain, SharedCalls) {
    let calls = SharedCalls::default();
    let tools = Toolchain {
        composer: Box::new(FakeComposer(calls.clone())),
        signer: Box::new(FakeSigner(calls.clone())),
        formatter: Box::new(FakeFormatter(calls.clone())),
        iso: Box::new(FakeIsoMaster(calls.clone())),
    };
    (tools, calls)
}

/// Directories for one build-uki run.
pub struct BuildFixture {
    pub temp: TempDir,
    pub rootfs: PathBuf,
    pub keys: PathBuf,
    pub support: PathBuf,
    pub output: PathBuf,
}

impl BuildFixture {
    pub fn new(release: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        let keys = temp.path().join("keys");
        let support = temp.path().join("support");
        let output = temp.path().join("output");

        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::create_dir_all(rootfs.join("boot")).unwrap();
        fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        fs::write(
            rootfs.join("etc/os-release"),
            format!("NAME=\"Kairos\"\nKAIROS_RELEASE=\"{}\"\n", release),
        )
        .unwrap();
        fs::write(rootfs.join("boot/vmlinuz-6.6.0"), b"kernel image").unwrap();
        fs::write(rootfs.join("boot/initrd"), b"distro initrd").unwrap();
        symlink("vmlinuz-6.6.0", rootfs.join("boot/vmlinuz")).unwrap();
        fs::write(rootfs.join("usr/bin/immucore"), b"#!/bin/sh\n").unwrap();

        fs::create_dir_all(&keys).unwrap();
        for name in REQUIRED_KEY_FILES {
            fs::write(keys.join(name), name.as_bytes()).unwrap();
        }

        fs::create_dir_all(&support).unwrap();
        let files = SupportFiles::in_dir(Arch::X86_64, &support);
        fs::write(&files.stub, b"stub").unwrap();
        fs::write(&files.systemd_boot, b"systemd-boot").unwrap();

        Self {
            temp,
            rootfs,
            keys,
            support,
            output,
        }
    }
}

/// [`CertAuthority`] backed by rcgen; signatures are fixed bytes.
pub struct FakeAuthority;

pub const FAKE_SIGNATURE: &[u8] = b"fake pkcs7 signature";

impl CertAuthority for FakeAuthority {
    fn create_certificate(&self, request: &CertRequest) -> Result<()> {
        let key = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, request.common_name.as_str());
        params.distinguished_name = dn;
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(request.days as i64);
        let cert = params.self_signed(&key)?;

        fs::write(&request.key, key.serialize_pem())?;
        fs::write(&request.pem, cert.pem())?;
        fs::write(&request.der, cert.der().to_vec())?;
        Ok(())
    }

    fn create_private_key(&self, path: &Path) -> Result<()> {
        fs::write(path, rcgen::KeyPair::generate()?.serialize_pem())?;
        Ok(())
    }

    fn sign_detached(&self, _data: &[u8], _key: &Path, _cert: &Path) -> Result<Vec<u8>> {
        Ok(FAKE_SIGNATURE.to_vec())
    }
}

/// Self-signed DER certificate with common name `cn`.
pub fn cert_der(cn: &str) -> Vec<u8> {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::default();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.self_signed(&key).unwrap().der().to_vec()
}

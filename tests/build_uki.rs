mod common;

use std::fs::{self, File};

use fs2::FileExt;

use common::{fake_toolchain, BuildFixture};
use enki::arch::Arch;
use enki::build::{BuildUki, LOCK_FILE};
use enki::cancel::Cancellation;
use enki::cmdline::{BASE_CMDLINE, INSTALL_MODE};
use enki::artifact::initramfs::InitrdCompression;
use enki::config::{OutputKind, UkiBuildConfig};
use enki::error::{build_error, BuildError};

fn config(fixture: &BuildFixture, kind: OutputKind) -> UkiBuildConfig {
    let mut config = UkiBuildConfig::new(
        fixture.rootfs.clone(),
        fixture.output.clone(),
        fixture.keys.clone(),
    )
    .unwrap();
    config.arch = Arch::X86_64;
    config.support_dir = fixture.support.clone();
    config.output_kind = kind;
    config
}

#[test]
fn test_iso_build_end_to_end() {
    let fixture = BuildFixture::new("v3.0.0");
    let (tools, calls) = fake_toolchain();
    let build = BuildUki::new(config(&fixture, OutputKind::Iso), tools, Cancellation::new());

    let output = build.run().unwrap();
    assert_eq!(output.version, "v3.0.0");

    let iso = fixture.output.join("kairos_v3.0.0.iso");
    let checksum = fixture.output.join("kairos_v3.0.0.iso.sha256");
    assert_eq!(output.artifacts, vec![iso.clone(), checksum.clone()]);
    assert!(iso.is_file());

    let sum = fs::read_to_string(&checksum).unwrap();
    assert!(sum.ends_with("  kairos_v3.0.0.iso\n"));
    assert_eq!(sum.split_whitespace().next().unwrap().len(), 64);

    // The fake ISO carries the ESP listing.
    let listing = fs::read_to_string(&iso).unwrap();
    for line in [
        "dir EFI/BOOT",
        "file EFI/BOOT/BOOTX64.EFI",
        "file EFI/kairos/artifact.efi",
        "file loader/loader.conf",
        "file loader/entries/artifact.conf",
        "file loader/keys/auto/PK.der",
        "file loader/keys/auto/KEK.auth",
        "file loader/keys/auto/db.auth",
    ] {
        assert!(listing.lines().any(|l| l == line), "missing '{}' in\n{}", line, listing);
    }
    assert_eq!(listing.matches(".efi").count(), 1);

    let calls = calls.borrow();
    assert_eq!(calls.cmdlines, vec![format!("{} {}", BASE_CMDLINE, INSTALL_MODE)]);
    assert_eq!(calls.iso_label.as_deref(), Some("UKI_ISO_INSTALL"));
    assert_eq!(calls.iso_bios, Some(false));
    assert!(calls.esp_size_mib.unwrap() >= 50);

    let initrds = &calls.initrds;
    assert_eq!(initrds.len(), 1);
    assert!(initrds[0].ends_with("initrd.zst"), "{}", initrds[0].display());

    // Nothing but the terminal artifacts and the lock is left behind.
    let mut names: Vec<_> = fs::read_dir(&fixture.output)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec![LOCK_FILE, "kairos_v3.0.0.iso", "kairos_v3.0.0.iso.sha256"]);

    // The caller's rootfs is untouched.
    assert!(fixture.rootfs.join("boot/vmlinuz").is_symlink());
    assert!(!fixture.rootfs.join("init").exists());
}

#[test]
fn test_uki_build_writes_tree() {
    let fixture = BuildFixture::new("v3.1.0");
    let (tools, calls) = fake_toolchain();
    let mut config = config(&fixture, OutputKind::Uki);
    config.extra_cmdlines = vec!["rd.cos.disable".to_string()];
    config.single_efi_cmdlines = vec!["Recovery: rd.immucore.recovery".to_string()];
    config.entry.include_cmdline = true;
    config.initrd_compression = InitrdCompression::Gzip;

    BuildUki::new(config, tools, Cancellation::new()).run().unwrap();

    let out = &fixture.output;
    for stem in ["artifact", "artifact_rd.cos.disable", "artifact_rd.immucore.recovery"] {
        assert!(out.join(format!("EFI/kairos/{}.efi", stem)).is_file(), "{}", stem);
        assert!(out.join(format!("loader/entries/{}.conf", stem)).is_file(), "{}", stem);
    }
    assert!(out.join("EFI/BOOT/BOOTX64.EFI").is_file());
    assert!(out.join("loader/keys/auto/db.der").is_file());
    assert!(out.join(LOCK_FILE).is_file());

    let recovery = fs::read_to_string(out.join("loader/entries/artifact_rd.immucore.recovery.conf")).unwrap();
    assert!(recovery.starts_with("title Recovery\n"));
    assert!(recovery.contains("cmdline rd.immucore.recovery\n"));

    let loader = fs::read_to_string(out.join("loader/loader.conf")).unwrap();
    assert!(loader.contains("default artifact.conf\n"));

    assert_eq!(calls.borrow().cmdlines.len(), 3);
    assert_eq!(calls.borrow().signed.len(), 1);
    assert!(calls.borrow().initrds.iter().all(|p| p.ends_with("initrd.gz")));
}

#[test]
fn test_container_build_writes_image_archive() {
    let fixture = BuildFixture::new("v3.0.0");
    let (tools, _calls) = fake_toolchain();
    let output = BuildUki::new(config(&fixture, OutputKind::Container), tools, Cancellation::new())
        .run()
        .unwrap();

    let archive = fixture.output.join("kairos_uki_v3.0.0.tar");
    assert_eq!(output.artifacts, vec![archive.clone()]);

    let mut names = Vec::new();
    let mut reader = tar::Archive::new(fs::File::open(&archive).unwrap());
    for entry in reader.entries().unwrap() {
        names.push(entry.unwrap().path().unwrap().to_string_lossy().into_owned());
    }
    assert!(names.iter().any(|n| n == "oci-layout"));
    assert!(names.iter().any(|n| n == "index.json"));
    assert!(names.iter().any(|n| n == "manifest.json"));
}

#[test]
fn test_missing_key_file_fails_before_writing() {
    let fixture = BuildFixture::new("v3.0.0");
    fs::remove_file(fixture.keys.join("db.auth")).unwrap();
    let (tools, calls) = fake_toolchain();

    let err = BuildUki::new(config(&fixture, OutputKind::Iso), tools, Cancellation::new())
        .run()
        .unwrap_err();
    assert!(matches!(
        build_error(&err),
        Some(BuildError::MissingKeyFile { path }) if path.ends_with("db.auth")
    ));
    assert!(!fixture.output.exists());
    assert!(calls.borrow().cmdlines.is_empty());
}

#[test]
fn test_missing_support_file() {
    let fixture = BuildFixture::new("v3.0.0");
    fs::remove_file(fixture.support.join("linuxx64.efi.stub")).unwrap();
    let (tools, _calls) = fake_toolchain();

    let err = BuildUki::new(config(&fixture, OutputKind::Uki), tools, Cancellation::new())
        .run()
        .unwrap_err();
    assert!(matches!(
        build_error(&err),
        Some(BuildError::MissingSupportFile { .. })
    ));
}

#[test]
fn test_cancelled_build_leaves_no_artifacts() {
    let fixture = BuildFixture::new("v3.0.0");
    let (tools, calls) = fake_toolchain();
    let cancel = Cancellation::new();
    cancel.cancel();

    let err = BuildUki::new(config(&fixture, OutputKind::Iso), tools, cancel)
        .run()
        .unwrap_err();
    assert!(matches!(build_error(&err), Some(BuildError::Cancelled)));
    assert!(calls.borrow().cmdlines.is_empty());
    assert!(!fixture.output.join("kairos_v3.0.0.iso").exists());
}

#[test]
fn test_locked_output_dir_is_refused() {
    let fixture = BuildFixture::new("v3.0.0");
    fs::create_dir_all(&fixture.output).unwrap();
    let held = File::create(fixture.output.join(LOCK_FILE)).unwrap();
    held.lock_exclusive().unwrap();

    let (tools, calls) = fake_toolchain();
    let err = BuildUki::new(config(&fixture, OutputKind::Uki), tools, Cancellation::new())
        .run()
        .unwrap_err();
    assert!(format!("{:#}", err).contains("another build"), "{:#}", err);
    assert!(calls.borrow().cmdlines.is_empty());

    // Once released, the same lock file is reused.
    held.unlock().unwrap();
    let (tools, _calls) = fake_toolchain();
    BuildUki::new(config(&fixture, OutputKind::Uki), tools, Cancellation::new())
        .run()
        .unwrap();
    assert!(fixture.output.join(LOCK_FILE).is_file());
}

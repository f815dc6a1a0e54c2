use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::error;

use enki::arch::Arch;
use enki::artifact::initramfs::InitrdCompression;
use enki::build::BuildUki;
use enki::cancel::Cancellation;
use enki::config::{load_config_file, ConfigFile, OutputKind, UkiBuildConfig};
use enki::error::{build_error, BuildError};
use enki::preflight;
use enki::secureboot::authority::{OpensslAuthority, AUTHORITY_TOOLS};
use enki::secureboot::{generate_key_set, KeySetOptions};
use enki::tools::{HostTools, Toolchain};

#[derive(Parser)]
#[command(name = "enki", version, about = "Build signed UKI boot artifacts and secure boot keys")]
struct Cli {
    /// Config file (default: <config dir>/enki/enki.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build UKIs from an extracted rootfs.
    BuildUki(BuildUkiArgs),
    /// Generate a secure boot key set.
    Genkey(GenkeyArgs),
}

#[derive(Args)]
struct BuildUkiArgs {
    /// Extracted root filesystem.
    rootfs: PathBuf,

    /// Directory with PK, KEK and db keys.
    #[arg(short, long)]
    keys: PathBuf,

    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Output type: uki, iso or container.
    #[arg(short = 'a', long = "output-type")]
    output_type: Option<OutputKind>,

    /// Extra cmdline; one additional UKI per occurrence.
    #[arg(short = 'c', long = "cmdline")]
    cmdlines: Vec<String>,

    /// Appended to the default cmdline of every UKI.
    #[arg(long)]
    extend_cmdline: Option<String>,

    /// "Title: cmdline" for a UKI with its own menu title.
    #[arg(long = "single-efi-cmdline")]
    single_efi_cmdlines: Vec<String>,

    /// Default loader.conf entry.
    #[arg(long)]
    default_entry: Option<String>,

    /// loader.conf secure-boot-enroll policy (off, manual, if-safe, force).
    #[arg(long)]
    secure_boot_enroll: Option<String>,

    /// Menu title prefix.
    #[arg(long)]
    boot_branding: Option<String>,

    #[arg(long)]
    include_version_in_config: bool,

    #[arg(long)]
    include_cmdline_in_config: bool,

    /// Warn when a UKI exceeds this many MiB.
    #[arg(long = "efi-size-warn")]
    efi_size_warn: Option<u64>,

    /// Directory merged into the rootfs before the initramfs is built.
    #[arg(long)]
    overlay_rootfs: Option<PathBuf>,

    /// Directory merged into the ISO root.
    #[arg(long)]
    overlay_iso: Option<PathBuf>,

    /// ISO base name (default: kairos_<version>).
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    arch: Option<String>,

    /// Directory with the EFI stub and systemd-boot binaries.
    #[arg(long)]
    support_dir: Option<PathBuf>,

    /// Initramfs compression: zstd or gzip.
    #[arg(long)]
    initrd_compression: Option<InitrdCompression>,

    /// Kill external tools that run longer than this.
    #[arg(long)]
    tool_timeout_secs: Option<u64>,
}

#[derive(Args)]
struct GenkeyArgs {
    /// Common name of the generated certificates.
    name: String,

    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Certificate lifetime in days.
    #[arg(short, long)]
    expiration_in_days: Option<u32>,

    /// Leave the Microsoft certificates out of KEK and db.
    #[arg(long = "skip-microsoft-certs-I-KNOW-WHAT-IM-DOING")]
    skip_microsoft_certs: bool,

    /// Directory with db and KEK firmware exports to include.
    #[arg(long)]
    custom_cert_dir: Option<PathBuf>,

    /// Directory with the vendor certificates (<dir>/KEK, <dir>/db);
    /// searched for in the usual install locations when unset.
    #[arg(long)]
    vendor_cert_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    let cancel = Cancellation::from_signals();
    let result = load_config_file(cli.config.as_deref()).and_then(|file| match cli.command {
        Command::BuildUki(args) => build_uki(args, &file, cancel),
        Command::Genkey(args) => genkey(args, &file, cancel),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            match build_error(&err) {
                Some(BuildError::Cancelled) => ExitCode::from(130),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn build_uki(args: BuildUkiArgs, file: &ConfigFile, cancel: Cancellation) -> Result<()> {
    let mut config = UkiBuildConfig::new(args.rootfs, args.output_dir, args.keys)?;
    config.apply_file(&file.build_uki)?;

    if let Some(kind) = args.output_type {
        config.output_kind = kind;
    }
    if let Some(ref arch) = args.arch {
        config.arch = Arch::parse(arch)?;
    }
    if let Some(dir) = args.support_dir {
        config.support_dir = dir;
    }
    if !args.cmdlines.is_empty() {
        config.extra_cmdlines = args.cmdlines;
    }
    if args.extend_cmdline.is_some() {
        config.extend_cmdline = args.extend_cmdline;
    }
    if !args.single_efi_cmdlines.is_empty() {
        config.single_efi_cmdlines = args.single_efi_cmdlines;
    }
    if args.overlay_rootfs.is_some() {
        config.overlay_rootfs = args.overlay_rootfs;
    }
    if args.overlay_iso.is_some() {
        config.iso.overlay = args.overlay_iso;
    }
    if args.name.is_some() {
        config.iso.name = args.name;
    }
    if let Some(compression) = args.initrd_compression {
        config.initrd_compression = compression;
    }
    if let Some(branding) = args.boot_branding {
        config.entry.boot_branding = branding;
    }
    if args.include_version_in_config {
        config.entry.include_version = true;
    }
    if args.include_cmdline_in_config {
        config.entry.include_cmdline = true;
    }
    if let Some(mib) = args.efi_size_warn {
        config.entry.efi_size_warn_mib = mib;
    }
    if args.default_entry.is_some() {
        config.loader.default_entry = args.default_entry;
    }
    if let Some(policy) = args.secure_boot_enroll {
        config.loader.secure_boot_enroll = policy;
    }
    if let Some(secs) = args.tool_timeout_secs {
        config.tool_timeout = Duration::from_secs(secs);
    }

    let tools = Toolchain::host(HostTools::new(config.tool_timeout, cancel.clone()));
    let build = BuildUki::new(config, tools, cancel);
    build.check_host_tools()?;
    let output = build.run()?;
    log::info!(
        "{} build of {} complete: {}",
        output.kind,
        output.version,
        output
            .artifacts
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn genkey(args: GenkeyArgs, file: &ConfigFile, cancel: Cancellation) -> Result<()> {
    let mut options = KeySetOptions::new(args.name);
    file.genkey.apply(&mut options);
    if let Some(days) = args.expiration_in_days {
        options.expiration_days = days;
    }
    if args.skip_microsoft_certs {
        options.include_vendor_certs = false;
    }
    if args.custom_cert_dir.is_some() {
        options.custom_cert_dir = args.custom_cert_dir;
    }
    if args.vendor_cert_dir.is_some() {
        options.vendor_cert_dir = args.vendor_cert_dir;
    }

    let output = match args.output.or_else(|| file.genkey.output.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };

    preflight::check_required_tools(AUTHORITY_TOOLS)?;
    let authority = OpensslAuthority::new(options.tool_timeout, cancel.clone());
    let keys = generate_key_set(&options, &output, &authority, &cancel)?;
    log::info!("keys written to {} (owner {})", keys.dir.display(), keys.owner);
    Ok(())
}

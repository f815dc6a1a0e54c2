//! Signed UKI boot artifacts and the secure boot keys behind them.
//!
//! Two entry points:
//!
//! - [`build::BuildUki`] turns an extracted root filesystem into signed
//!   Unified Kernel Images plus a systemd-boot tree, delivered as that raw
//!   tree, a hybrid ISO, or an OCI image archive.
//! - [`secureboot::generate_key_set`] creates the PK, KEK and db key
//!   hierarchy (certificates, signature lists, authenticated variables)
//!   that builds sign against and firmware enrolls.
//!
//! # Architecture
//!
//! ```text
//! enki
//!     │
//!     ├── build        orchestration, locking, cleanup
//!     ├── artifact     rootfs, initramfs, UKI tree, ESP, ISO, OCI
//!     ├── secureboot   ESL/auth encoding, key set generation
//!     ├── tools        traits over ukify, sbsign, mtools, xorriso
//!     └── process      external commands with timeouts and cancellation
//! ```
//!
//! External binaries are reached only through the traits in [`tools`] and
//! [`secureboot::authority`], so everything above them can be exercised
//! with fakes.

pub mod arch;
pub mod artifact;
pub mod build;
pub mod cancel;
pub mod cleanup;
pub mod cmdline;
pub mod config;
pub mod error;
pub mod os_release;
pub mod preflight;
pub mod process;
pub mod secureboot;
pub mod tools;

pub use build::{BuildOutput, BuildUki};
pub use config::{OutputKind, UkiBuildConfig};
pub use error::BuildError;
pub use secureboot::{generate_key_set, KeySet, KeySetOptions};

//! Artifact builders for UKI boot media.
//!
//! - [`rootfs`] - Copy and prepare the rootfs the initramfs is built from
//! - [`cpio`] / [`initramfs`] - Reproducible compressed newc archives
//! - [`uki`] - Signed UKIs, boot entries and `loader.conf`
//! - [`manifest`] / [`esp`] - FAT32 EFI system partition image
//! - [`iso`] - Hybrid ISO and its checksum
//! - [`package`] / [`oci`] - Raw tree copy or OCI image archive

pub mod cpio;
pub mod esp;
pub mod filesystem;
pub mod initramfs;
pub mod iso;
pub mod manifest;
pub mod oci;
pub mod package;
pub mod rootfs;
pub mod uki;

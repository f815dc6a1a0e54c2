//! Terminal packaging of an artifact tree that does not go through an ISO.

use anyhow::Result;
use log::info;
use std::path::{Path, PathBuf};

use super::filesystem::copy_dir_recursive;
use super::oci::{write_image_archive, ImageRef};
use crate::arch::Arch;

/// Repository name of container outputs.
pub const CONTAINER_IMAGE_NAME: &str = "kairos_uki";

/// Copy the tree verbatim into `output_dir`.
pub fn package_tree(tree: &Path, output_dir: &Path) -> Result<()> {
    info!("[package] copying artifacts to {}", output_dir.display());
    copy_dir_recursive(tree, output_dir)
}

/// File name of the container archive for `version`.
pub fn container_file_name(version: &str) -> String {
    format!("{}_{}.tar", CONTAINER_IMAGE_NAME, version)
}

/// Write `kairos_uki_<version>.tar`, tagged `kairos_uki:<version>`.
pub fn package_container(
    tree: &Path,
    output_dir: &Path,
    version: &str,
    arch: Arch,
    work: &Path,
) -> Result<PathBuf> {
    let output = output_dir.join(container_file_name(version));
    let image = ImageRef::new(CONTAINER_IMAGE_NAME, version);
    info!("[package] writing image {} to {}", image, output.display());
    write_image_archive(tree, &output, &image, arch, work)?;
    Ok(output)
}

//! EFI system partition image.

use anyhow::Result;
use log::info;
use std::path::Path;

use super::manifest::ArtifactManifest;
use crate::cancel::Cancellation;
use crate::tools::ImageFormatter;

/// File name of the ESP image inside the ISO.
pub const ESP_IMAGE_NAME: &str = "efiboot.img";

/// Free space added on top of the payload.
pub const ESP_HEADROOM_MIB: u64 = 50;

const MIB: u64 = 1024 * 1024;

/// Image size for `payload_bytes` of files: whole MiB, rounded up, plus headroom.
pub fn esp_image_size_mib(payload_bytes: u64) -> u64 {
    payload_bytes.div_ceil(MIB) + ESP_HEADROOM_MIB
}

/// Create a FAT32 image at `image` holding everything in `manifest`.
///
/// Returns the image size in MiB.
pub fn build_esp_image(
    manifest: &ArtifactManifest,
    image: &Path,
    formatter: &dyn ImageFormatter,
    cancel: &Cancellation,
) -> Result<u64> {
    let size_mib = esp_image_size_mib(manifest.total_size()?);
    info!("[esp] creating {} MiB FAT32 image", size_mib);
    formatter.create(image, size_mib)?;

    for dir in manifest.dirs() {
        cancel.checkpoint()?;
        formatter.mkdir(image, dir)?;
    }

    for (dir, files) in manifest.entries() {
        for file in files {
            cancel.checkpoint()?;
            formatter.copy(image, file, dir)?;
        }
    }

    info!("[esp] populated {}", image.display());
    Ok(size_mib)
}

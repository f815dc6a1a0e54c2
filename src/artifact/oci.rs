//! OCI image archive writer.
//!
//! Packs an artifact tree as a single-layer image and writes it as a tar
//! holding both an OCI image layout (`oci-layout`, `index.json`,
//! `blobs/sha256/*`) and a docker-style `manifest.json`, so the archive
//! loads with `docker load`, `podman load` and OCI tooling alike.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::arch::Arch;

const MEDIA_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const MEDIA_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const MEDIA_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// `name:tag` reference the image is loaded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: String,
    digest: String,
    size: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    schema_version: u32,
    media_type: &'static str,
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    schema_version: u32,
    media_type: &'static str,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Debug, Serialize)]
struct RootFs {
    #[serde(rename = "type")]
    kind: &'static str,
    diff_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ImageConfig {
    architecture: &'static str,
    os: &'static str,
    rootfs: RootFs,
    config: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DockerManifestEntry {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// A blob ready to be placed under `blobs/sha256/`.
struct Blob {
    digest: String,
    size: u64,
    source: BlobSource,
}

enum BlobSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Blob {
    fn from_bytes(bytes: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&bytes));
        Self {
            digest,
            size: bytes.len() as u64,
            source: BlobSource::Bytes(bytes),
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        );
        let mut hasher = Sha256::new();
        let size = io::copy(&mut reader, &mut hasher)?;
        Ok(Self {
            digest: hex::encode(hasher.finalize()),
            size,
            source: BlobSource::File(path.to_path_buf()),
        })
    }

    fn path(&self) -> String {
        format!("blobs/sha256/{}", self.digest)
    }

    fn descriptor(&self, media_type: &str, annotations: BTreeMap<String, String>) -> Descriptor {
        Descriptor {
            media_type: media_type.to_string(),
            digest: format!("sha256:{}", self.digest),
            size: self.size,
            annotations,
        }
    }
}

/// Write `tree` as a single-layer image archive at `output`.
///
/// `work` holds the intermediate layer tar.
pub fn write_image_archive(
    tree: &Path,
    output: &Path,
    image: &ImageRef,
    arch: Arch,
    work: &Path,
) -> Result<()> {
    let layer_path = work.join("layer.tar");
    write_layer(tree, &layer_path)?;
    let layer = Blob::from_file(&layer_path)?;

    let config = ImageConfig {
        architecture: arch.oci_name(),
        os: "linux",
        rootfs: RootFs {
            kind: "layers",
            diff_ids: vec![format!("sha256:{}", layer.digest)],
        },
        config: BTreeMap::new(),
    };
    let config = Blob::from_bytes(serde_json::to_vec(&config)?);

    let manifest = ImageManifest {
        schema_version: 2,
        media_type: MEDIA_MANIFEST,
        config: config.descriptor(MEDIA_CONFIG, BTreeMap::new()),
        layers: vec![layer.descriptor(MEDIA_LAYER, BTreeMap::new())],
    };
    let manifest = Blob::from_bytes(serde_json::to_vec(&manifest)?);

    let mut annotations = BTreeMap::new();
    annotations.insert("io.containerd.image.name".to_string(), image.to_string());
    annotations.insert("org.opencontainers.image.ref.name".to_string(), image.tag.clone());
    let index = ImageIndex {
        schema_version: 2,
        media_type: MEDIA_INDEX,
        manifests: vec![manifest.descriptor(MEDIA_MANIFEST, annotations)],
    };

    let docker = vec![DockerManifestEntry {
        config: config.path(),
        repo_tags: vec![image.to_string()],
        layers: vec![layer.path()],
    }];

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut builder = TarBuilder::new(BufWriter::new(file));
    append_bytes(&mut builder, "oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#)?;
    append_bytes(&mut builder, "index.json", &serde_json::to_vec(&index)?)?;
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&docker)?)?;
    append_dir(&mut builder, "blobs")?;
    append_dir(&mut builder, "blobs/sha256")?;
    for blob in [&config, &manifest, &layer] {
        append_blob(&mut builder, blob)?;
    }
    let mut out = builder
        .into_inner()
        .context("Failed to finalize image archive")?;
    out.flush()?;

    fs::remove_file(&layer_path).ok();
    Ok(())
}

/// Uncompressed, reproducible tar of `src_dir`.
fn write_layer(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let mut builder = TarBuilder::new(BufWriter::new(out));

    for ent in WalkDir::new(src_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let ent = ent.with_context(|| format!("walking {}", src_dir.display()))?;
        let p = ent.path();
        let rel = p.strip_prefix(src_dir).unwrap_or(p).to_string_lossy().into_owned();
        let md = fs::symlink_metadata(p)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(md.permissions().mode());

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, rel, io::empty())?;
        } else if md.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            let mut f = File::open(p)?;
            builder.append_data(&mut header, rel, &mut f)?;
        }
    }

    let mut out = builder.into_inner().context("Failed to finalize layer")?;
    out.flush()?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut TarBuilder<W>, path: &str) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, io::empty())?;
    Ok(())
}

fn append_bytes<W: Write>(builder: &mut TarBuilder<W>, path: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, bytes)?;
    Ok(())
}

fn append_blob<W: Write>(builder: &mut TarBuilder<W>, blob: &Blob) -> Result<()> {
    match blob.source {
        BlobSource::Bytes(ref bytes) => append_bytes(builder, &blob.path(), bytes),
        BlobSource::File(ref path) => {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(blob.size);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_cksum();
            let mut f = File::open(path)?;
            builder.append_data(&mut header, blob.path(), &mut f)?;
            Ok(())
        }
    }
}

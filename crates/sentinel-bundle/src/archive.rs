//! Archive assembly: stage the bundle files in a per-bundle temp directory,
//! tar them, and compress with zstd (preferred) or gzip (fallback).
//!
//! The temp directory is released on every exit path; [`tempfile::TempDir`]
//! cleans up on drop.

use std::fs;
use std::io::Write;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use sentinel_types::{BundleManifest, ManifestFile, clock};

/// File name of the configuration source inside the archive.
pub const CONFIG_FILE: &str = "sentinel.kdl";
/// File name of the manifest inside the archive.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Outer compression applied to the tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Zstd,
    Gzip,
}

impl Compression {
    /// Archive file extension, `tar.zst` or `tar.gz`.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Zstd => "tar.zst",
            Compression::Gzip => "tar.gz",
        }
    }
}

/// A fully assembled archive and its derived metadata.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub bytes: Vec<u8>,
    /// SHA-256 hex of `bytes`; the bundle's content address.
    pub checksum: String,
    pub manifest: BundleManifest,
    pub compression: Compression,
}

/// Object-store key for a bundle archive.
pub fn storage_key(project_id: Uuid, bundle_id: Uuid, compression: Compression) -> String {
    format!("bundles/{project_id}/{bundle_id}.{}", compression.extension())
}

/// Assemble the archive for one bundle.
pub fn build_archive(
    bundle_id: Uuid,
    config_source: &str,
    compression: Compression,
) -> Result<BuiltArchive> {
    let staging = tempfile::Builder::new()
        .prefix(&format!("sentinel-bundle-{bundle_id}-"))
        .tempdir()
        .context("failed to create staging dir")?;

    let config_path = staging.path().join(CONFIG_FILE);
    fs::write(&config_path, config_source)
        .with_context(|| format!("failed to stage {CONFIG_FILE}"))?;

    let manifest = BundleManifest {
        bundle_id,
        assembled_at: clock::now(),
        files: vec![ManifestFile {
            path: CONFIG_FILE.to_string(),
            checksum: hex::encode(Sha256::digest(config_source.as_bytes())),
            size: config_source.len() as u64,
        }],
    };
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize manifest")?;
    let manifest_path = staging.path().join(MANIFEST_FILE);
    fs::write(&manifest_path, &manifest_json)
        .with_context(|| format!("failed to stage {MANIFEST_FILE}"))?;

    let mut tar = tar::Builder::new(Vec::new());
    tar.append_path_with_name(&config_path, CONFIG_FILE)
        .context("failed to tar config source")?;
    tar.append_path_with_name(&manifest_path, MANIFEST_FILE)
        .context("failed to tar manifest")?;
    let tar_bytes = tar.into_inner().context("failed to finish tar stream")?;

    let bytes = match compression {
        Compression::Zstd => {
            zstd::encode_all(tar_bytes.as_slice(), 3).context("zstd compression failed")?
        }
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&tar_bytes).context("gzip compression failed")?;
            encoder.finish().context("gzip finish failed")?
        }
    };

    let checksum = hex::encode(Sha256::digest(&bytes));
    Ok(BuiltArchive { bytes, checksum, manifest, compression })
}

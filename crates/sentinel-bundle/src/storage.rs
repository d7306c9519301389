//! Object storage for bundle archives.
//!
//! The control plane never serves archive bytes; nodes download through
//! presigned references with a bounded TTL. Writes are keyed by bundle id, so
//! concurrent writers never collide on a key.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use sentinel_types::clock;

/// Storage backend for immutable bundle archives.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// A time-limited download reference for `key`.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Signature over `key` + expiry, embedded in presigned references.
pub fn presign_signature(secret: &str, key: &str, expires: i64) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .context("failed to initialize HMAC")?;
    mac.update(key.as_bytes());
    mac.update(b":");
    mac.update(expires.to_string().as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Filesystem-backed object store.
///
/// Objects live under `root`; presigned references point at `base_url` and
/// carry an HMAC the (external) artifact gateway checks.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    base_url: String,
    presign_secret: String,
}

impl FsObjectStore {
    pub fn new(root: PathBuf, base_url: impl Into<String>, presign_secret: impl Into<String>) -> Self {
        Self {
            root,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            presign_secret: presign_secret.into(),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create object dir for {key}"))?;
        }
        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write object {key}"))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to finalize object {key}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.object_path(key))
            .await
            .with_context(|| format!("failed to read object {key}"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(key)).await.unwrap_or(false))
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        let expires = clock::now().timestamp() + ttl.as_secs() as i64;
        let signature = presign_signature(&self.presign_secret, key, expires)?;
        Ok(format!("{}/{key}?expires={expires}&sig={signature}", self.base_url))
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed artifact storage.
//!
//! Blobs are keyed by their SHA-256. Writing the same content twice is a
//! no-op, so concurrent writers never conflict. Download links are signed
//! with HMAC-SHA256 over `hash:expires`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::ArtifactRef;

type HmacSha256 = Hmac<Sha256>;

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether `hash` looks like a lowercase hex SHA-256.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Time-limited download link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Blob store used by the executor, the ledger and the advice tools.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes`. If `expected_hash` is given the content must match it.
    async fn put(&self, bytes: &[u8], kind: &str, expected_hash: Option<&str>)
    -> Result<ArtifactRef>;

    async fn get(&self, hash: &str) -> Result<Vec<u8>>;

    async fn exists(&self, hash: &str) -> Result<bool>;

    /// URI handed to runners in `inputs.json`.
    fn uri(&self, hash: &str) -> String;

    /// Signed download link valid for `ttl`.
    fn signed_url(&self, hash: &str, ttl: Duration) -> Result<SignedUrl>;

    /// Check a signature produced by [`signed_url`](Self::signed_url).
    fn verify_signature(&self, hash: &str, expires: i64, signature: &str) -> Result<()>;

    /// Delete blobs outside `referenced` that are older than `min_age`.
    async fn gc(&self, referenced: &HashSet<String>, min_age: Duration) -> Result<usize>;
}

/// Filesystem-backed store: `<root>/blobs/<hash[0..2]>/<hash>`.
pub struct FsArtifactStore {
    root: PathBuf,
    public_url: String,
    signing_key: Vec<u8>,
}

impl FsArtifactStore {
    /// Create the store, making its directories.
    pub fn new(
        root: impl Into<PathBuf>,
        public_url: impl Into<String>,
        signing_key: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs"))?;
        std::fs::create_dir_all(root.join("tmp"))?;
        Ok(Self {
            root,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            signing_key: signing_key.into(),
        })
    }

    /// Path of a blob on disk.
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        let shard = hash.get(..2).unwrap_or("xx");
        self.root.join("blobs").join(shard).join(hash)
    }

    fn checked_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_valid_hash(hash) {
            return Err(CoreError::ArtifactPersistError {
                subject: hash.to_string(),
                reason: "not a sha256 hex digest".to_string(),
            });
        }
        Ok(self.blob_path(hash))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.signing_key).map_err(CoreError::internal)
    }

    fn signature(&self, hash: &str, expires: i64) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(format!("{}:{}", hash, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        bytes: &[u8],
        kind: &str,
        expected_hash: Option<&str>,
    ) -> Result<ArtifactRef> {
        let hash = sha256_hex(bytes);
        if let Some(expected) = expected_hash
            && !expected.eq_ignore_ascii_case(&hash)
        {
            return Err(CoreError::ArtifactPersistError {
                subject: expected.to_string(),
                reason: format!("content hashes to {}", hash),
            });
        }

        let path = self.blob_path(&hash);
        if !tokio::fs::try_exists(&path).await? {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            debug!(hash = %hash, size = bytes.len(), "Stored artifact blob");
        }

        Ok(ArtifactRef {
            hash,
            size: bytes.len() as u64,
            kind: kind.to_string(),
            name: None,
        })
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.checked_path(hash)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::not_found("artifact", hash))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        if !is_valid_hash(hash) {
            return Ok(false);
        }
        Ok(tokio::fs::try_exists(self.blob_path(hash)).await?)
    }

    fn uri(&self, hash: &str) -> String {
        format!("file://{}", self.blob_path(hash).display())
    }

    fn signed_url(&self, hash: &str, ttl: Duration) -> Result<SignedUrl> {
        let ttl = chrono::Duration::from_std(ttl).map_err(CoreError::internal)?;
        let expires_at = Utc::now() + ttl;
        let expires = expires_at.timestamp();
        let signature = self.signature(hash, expires)?;

        Ok(SignedUrl {
            url: format!(
                "{}/api/v1/artifacts/{}?expires={}&signature={}",
                self.public_url, hash, expires, signature
            ),
            expires_at,
        })
    }

    fn verify_signature(&self, hash: &str, expires: i64, signature: &str) -> Result<()> {
        if expires < Utc::now().timestamp() {
            return Err(CoreError::not_found("artifact link", hash));
        }
        let provided =
            hex::decode(signature).map_err(|_| CoreError::not_found("artifact link", hash))?;

        let mut mac = self.mac()?;
        mac.update(format!("{}:{}", hash, expires).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| CoreError::not_found("artifact link", hash))
    }

    async fn gc(&self, referenced: &HashSet<String>, min_age: Duration) -> Result<usize> {
        let mut removed = 0;
        let cutoff = SystemTime::now()
            .checked_sub(min_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut shards = tokio::fs::read_dir(self.root.join("blobs")).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut blobs = tokio::fs::read_dir(shard.path()).await?;
            while let Some(blob) = blobs.next_entry().await? {
                let name = blob.file_name().to_string_lossy().to_string();
                if referenced.contains(&name) {
                    continue;
                }
                let modified = blob.metadata().await?.modified()?;
                if modified > cutoff {
                    continue;
                }
                match tokio::fs::remove_file(blob.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(hash = %name, error = %e, "Failed to remove blob"),
                }
            }
        }

        if removed > 0 {
            info!(removed, "Artifact garbage collection finished");
        }
        Ok(removed)
    }
}

/// Read a file and store it, verifying its declared hash.
pub async fn put_file(
    store: &dyn ArtifactStore,
    path: &Path,
    kind: &str,
    expected_hash: &str,
) -> Result<ArtifactRef> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CoreError::ArtifactPersistError {
            subject: expected_hash.to_string(),
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;

    let mut artifact = store.put(&bytes, kind, Some(expected_hash)).await?;
    artifact.name = path.file_name().map(|n| n.to_string_lossy().to_string());
    Ok(artifact)
}

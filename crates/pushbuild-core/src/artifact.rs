//! Artifact storage abstraction.
//!
//! Artifacts are addressed by the SHA-256 of their content, so storing the
//! same bytes twice yields the same reference.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Hex SHA-256 of the stored bytes.
    pub digest: String,
    /// Where readers can fetch it (URL or path, backend-specific).
    pub location: String,
    /// Size in bytes.
    pub size: u64,
}

/// Hex SHA-256 of `data`.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Trait for write-once artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `data`. Idempotent for identical content.
    async fn put(&self, data: Bytes) -> Result<ArtifactRef>;

    /// Retrieve an artifact.
    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes>;
}

//! Content-addressed artifact store on the local filesystem.

use async_trait::async_trait;
use bytes::Bytes;
use pushbuild_config::StoreConfig;
use pushbuild_core::artifact::{ArtifactRef, ArtifactStore, content_digest};
use pushbuild_core::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// Stores each artifact once under `root/<first two hex digits>/<sha256>`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
    public_url: Option<Url>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_url: Option<Url>) -> Self {
        Self {
            root: root.into(),
            public_url,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.path.clone(), config.public_url.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the artifact with `digest` lives. Rejects anything that is
    /// not a SHA-256 hex digest.
    pub fn path_for(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.root.join(shard(digest)?).join(digest))
    }

    fn location(&self, digest: &str) -> Result<String> {
        let path = self.path_for(digest)?;
        let relative = format!("{}/{}", shard(digest)?, digest);
        Ok(self
            .public_url
            .as_ref()
            .and_then(|base| base.join(&relative).ok())
            .map(String::from)
            .unwrap_or_else(|| path.display().to_string()))
    }

    fn reference(&self, digest: String, size: u64) -> Result<ArtifactRef> {
        Ok(ArtifactRef {
            location: self.location(&digest)?,
            digest,
            size,
        })
    }
}

/// Directory holding `digest`: its first two hex digits.
fn shard(digest: &str) -> Result<&str> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidInput(format!("invalid digest: {}", digest)));
    }
    Ok(&digest[..2])
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, data: Bytes) -> Result<ArtifactRef> {
        let digest = content_digest(&data);
        let size = data.len() as u64;
        let path = self.path_for(&digest)?;

        if tokio::fs::try_exists(&path).await? {
            debug!(digest = %digest, "Artifact already stored");
            return self.reference(digest, size);
        }

        let dir = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        // Readers never observe a partial file.
        let temp = dir.join(format!(".{}.{}.tmp", digest, uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(digest = %digest, size, path = %path.display(), "Stored artifact");
        self.reference(digest, size)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes> {
        let path = self.path_for(&reference.digest)?;
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("artifact {}", reference.digest)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

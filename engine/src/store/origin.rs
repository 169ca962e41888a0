//! Where template archives come from on a cache miss.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// An archive as delivered by origin, with what origin claims about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTemplate {
    pub bytes: Vec<u8>,
    /// Advertised hash; verified before the bytes are trusted.
    pub sha256: String,
    /// Advertised size in bytes.
    pub size: u64,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OriginError {
    /// Origin answered and does not know the template. Not retried.
    #[error("template '{0}' does not exist at origin")]
    NotFound(String),

    /// Origin could not be reached or answered garbage. Retried.
    #[error("{0}")]
    Unavailable(String),
}

impl OriginError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OriginError::Unavailable(_))
    }
}

/// Fetch collaborator consulted by the integrity store.
#[async_trait]
pub trait TemplateOrigin: Send + Sync {
    async fn fetch(&self, template_id: &str) -> Result<FetchedTemplate, OriginError>;
}

/// Sidecar describing one archive in a [`MirrorOrigin`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorEntry {
    pub name: String,
    pub version: String,
    pub sha256: String,
    pub size: u64,
    /// Archive file name, relative to the mirror root.
    pub archive: String,
}

/// A directory standing in for the remote catalog.
///
/// Each template `<id>` is described by `<root>/<id>.json` (a
/// [`MirrorEntry`]) next to the archive file it names.
#[derive(Debug, Clone)]
pub struct MirrorOrigin {
    root: PathBuf,
}

impl MirrorOrigin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Add `archive` to the mirror under `template_id`, advertising its real
    /// hash and size. Returns the sidecar that was written.
    pub fn publish(
        &self,
        template_id: &str,
        name: &str,
        version: &str,
        archive: &[u8],
    ) -> io::Result<MirrorEntry> {
        if !is_plain_id(template_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("template id '{template_id}' must be a single path segment"),
            ));
        }
        std::fs::create_dir_all(&self.root)?;
        let archive_name = format!("{template_id}.archive");
        std::fs::write(self.root.join(&archive_name), archive)?;
        let entry = MirrorEntry {
            name: name.to_string(),
            version: version.to_string(),
            sha256: sha256_hex(archive),
            size: archive.len() as u64,
            archive: archive_name,
        };
        let sidecar = serde_json::to_vec_pretty(&entry).map_err(io::Error::other)?;
        std::fs::write(self.root.join(format!("{template_id}.json")), sidecar)?;
        Ok(entry)
    }
}

#[async_trait]
impl TemplateOrigin for MirrorOrigin {
    async fn fetch(&self, template_id: &str) -> Result<FetchedTemplate, OriginError> {
        if !is_plain_id(template_id) {
            return Err(OriginError::NotFound(template_id.to_string()));
        }

        let sidecar_path = self.root.join(format!("{template_id}.json"));
        let raw = match tokio::fs::read(&sidecar_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(OriginError::NotFound(template_id.to_string()));
            }
            Err(err) => {
                return Err(OriginError::Unavailable(format!(
                    "cannot read {}: {err}",
                    sidecar_path.display()
                )));
            }
        };
        let entry: MirrorEntry = serde_json::from_slice(&raw).map_err(|err| {
            OriginError::Unavailable(format!("malformed {}: {err}", sidecar_path.display()))
        })?;

        if !is_plain_id(&entry.archive) {
            return Err(OriginError::Unavailable(format!(
                "sidecar for '{template_id}' points outside the mirror"
            )));
        }
        let archive_path = self.root.join(&entry.archive);
        let bytes = tokio::fs::read(&archive_path).await.map_err(|err| {
            OriginError::Unavailable(format!("cannot read {}: {err}", archive_path.display()))
        })?;

        tracing::debug!(template_id, bytes = bytes.len(), "fetched template from mirror");
        Ok(FetchedTemplate {
            bytes,
            sha256: entry.sha256,
            size: entry.size,
            name: entry.name,
            version: entry.version,
        })
    }
}

fn is_plain_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

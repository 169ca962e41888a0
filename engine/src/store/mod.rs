//! Integrity Store: template id → verified, content-addressed archive.
//!
//! Every read re-hashes the blob on disk. A miss or a bad hash goes to the
//! origin collaborator; fetched bytes are checked against what origin
//! advertised, written, re-read and re-hashed before they are trusted.

pub mod manifest;
pub mod origin;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::atomic::{AtomicWriter, blocking};
use crate::config::OriginConfig;
use crate::error::{EngineError, IntegrityStage, Result};

pub use manifest::{Manifest, RecordOrigin, TemplateRecord};
pub use origin::{FetchedTemplate, MirrorEntry, MirrorOrigin, OriginError, TemplateOrigin, sha256_hex};

/// Verified archive bytes and the record that vouches for them.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub bytes: Vec<u8>,
    pub record: TemplateRecord,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: u64,
}

pub struct IntegrityStore {
    root: PathBuf,
    origin: Arc<dyn TemplateOrigin>,
    config: OriginConfig,
    writer: AtomicWriter,
    manifest: Mutex<Manifest>,
}

impl std::fmt::Debug for IntegrityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityStore")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IntegrityStore {
    /// Open (creating if needed) the cache rooted at `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        origin: Arc<dyn TemplateOrigin>,
        config: OriginConfig,
    ) -> Result<Self> {
        let root = root.into();
        let blobs = root.join("blobs");
        std::fs::create_dir_all(&blobs).map_err(|e| EngineError::io(&blobs, e))?;
        let manifest = Manifest::load(&root)?;
        tracing::debug!(
            root = %root.display(),
            templates = manifest.templates.len(),
            "integrity store opened"
        );
        Ok(Self {
            root,
            origin,
            config,
            writer: AtomicWriter::new(),
            manifest: Mutex::new(manifest),
        })
    }

    /// Use `writer` for blob and manifest writes.
    pub fn with_writer(mut self, writer: AtomicWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return verified bytes for `template_id`.
    ///
    /// `force_refresh` always asks origin first; if origin is unreachable
    /// and a verified local copy exists, that copy is returned with a
    /// warning.
    pub async fn resolve(&self, template_id: &str, force_refresh: bool) -> Result<Resolved> {
        let cached = self.manifest.lock().await.templates.get(template_id).cloned();
        let local = match &cached {
            Some(record) => self
                .read_verified(record)
                .await
                .map(|bytes| (bytes, record.reverified())),
            None => None,
        };

        let local = match (force_refresh, local) {
            (false, Some((bytes, record))) => {
                self.commit_record(record.clone()).await?;
                tracing::debug!(template_id, sha256 = %record.sha256, "cache hit");
                return Ok(Resolved {
                    bytes,
                    record,
                    warnings: Vec::new(),
                });
            }
            (_, local) => local,
        };

        match (self.fetch(template_id).await, local) {
            (Ok(fetched), _) => self.admit(template_id, fetched).await,
            (Err(EngineError::OriginUnavailable { reason, .. }), Some((bytes, record))) => {
                tracing::warn!(
                    template_id,
                    reason = %reason,
                    "origin unreachable on refresh; serving verified local copy"
                );
                self.commit_record(record.clone()).await?;
                Ok(Resolved {
                    bytes,
                    record,
                    warnings: vec![format!(
                        "ORIGIN_UNAVAILABLE: refresh failed ({reason}); using verified local copy"
                    )],
                })
            }
            (Err(err), _) => Err(err),
        }
    }

    /// Every known template, from the manifest only.
    pub async fn list_known(&self) -> Vec<TemplateRecord> {
        self.manifest
            .lock()
            .await
            .templates
            .values()
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> StoreStats {
        let manifest = self.manifest.lock().await;
        StoreStats {
            entries: manifest.templates.len(),
            total_bytes: manifest.templates.values().map(|r| r.size).sum(),
        }
    }

    /// Blob bytes if present and matching the record's hash.
    async fn read_verified(&self, record: &TemplateRecord) -> Option<Vec<u8>> {
        let path = record.blob_in(&self.root);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(template_id = %record.id, blob = %path.display(), error = %err, "cached blob unreadable");
                return None;
            }
        };
        let actual = sha256_hex(&bytes);
        if actual != record.sha256 {
            tracing::warn!(
                template_id = %record.id,
                blob = %path.display(),
                expected = %record.sha256,
                actual = %actual,
                corrupt_cache = true,
                "cached blob failed verification; refetching"
            );
            return None;
        }
        Some(bytes)
    }

    async fn fetch(&self, template_id: &str) -> Result<FetchedTemplate> {
        let timeout = self.config.timeout();
        let origin = &self.origin;
        let attempt = move || async move {
            match tokio::time::timeout(timeout, origin.fetch(template_id)).await {
                Ok(result) => result,
                Err(_) => Err(OriginError::Unavailable(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        };

        let initial = self.config.initial_backoff();
        let backoff = ExponentialBuilder::default()
            .with_min_delay(initial)
            .with_max_delay(initial * 16)
            .with_factor(2.0)
            .with_max_times(self.config.max_retries);

        attempt
            .retry(backoff)
            .when(OriginError::is_retryable)
            .notify(|err, delay| {
                tracing::debug!(template_id, error = %err, delay_ms = delay.as_millis() as u64, "origin fetch failed; retrying");
            })
            .await
            .map_err(|err| match err {
                OriginError::NotFound(_) => EngineError::TemplateNotFound {
                    template_id: template_id.to_string(),
                },
                OriginError::Unavailable(reason) => EngineError::OriginUnavailable {
                    template_id: template_id.to_string(),
                    reason,
                },
            })
    }

    /// Verify, store and record freshly fetched bytes.
    async fn admit(&self, template_id: &str, fetched: FetchedTemplate) -> Result<Resolved> {
        let actual = sha256_hex(&fetched.bytes);
        let advertised = fetched.sha256.to_ascii_lowercase();
        let actual_size = fetched.bytes.len() as u64;
        if actual != advertised || actual_size != fetched.size {
            let (expected, actual) = if actual != advertised {
                (advertised, actual)
            } else {
                (
                    format!("{} bytes", fetched.size),
                    format!("{actual_size} bytes"),
                )
            };
            tracing::error!(template_id, %expected, %actual, "origin delivered bytes that do not match its advertisement");
            return Err(EngineError::IntegrityMismatch {
                template_id: template_id.to_string(),
                expected,
                actual,
                stage: IntegrityStage::Origin,
            });
        }

        let mut warnings = Vec::new();
        if !manifest::is_semver(&fetched.version) {
            tracing::info!(template_id, version = %fetched.version, "origin version is not MAJOR.MINOR.PATCH");
            warnings.push(format!(
                "NONSTANDARD_VERSION: '{}' is not MAJOR.MINOR.PATCH",
                fetched.version
            ));
        }

        let blob_path = manifest::blob_relpath(&actual);
        let absolute = self.root.join(&blob_path);
        let writer = self.writer.clone();
        let target = absolute.clone();
        let bytes = fetched.bytes;
        blocking(&absolute, move || writer.write_one(&target, &bytes)).await?;

        let reread = tokio::fs::read(&absolute)
            .await
            .map_err(|e| EngineError::io(&absolute, e))?;
        let rehashed = sha256_hex(&reread);
        if rehashed != actual {
            tracing::error!(template_id, blob = %absolute.display(), "blob changed between write and re-read");
            return Err(EngineError::IntegrityMismatch {
                template_id: template_id.to_string(),
                expected: actual,
                actual: rehashed,
                stage: IntegrityStage::Written,
            });
        }

        let record = TemplateRecord {
            id: template_id.to_string(),
            name: fetched.name,
            version: fetched.version,
            sha256: actual,
            size: actual_size,
            blob_path,
            verified_at: Utc::now(),
            origin: RecordOrigin::Remote,
        };
        self.commit_record(record.clone()).await?;
        tracing::info!(template_id, sha256 = %record.sha256, size = record.size, "template fetched from origin");

        Ok(Resolved {
            bytes: reread,
            record,
            warnings,
        })
    }

    async fn commit_record(&self, record: TemplateRecord) -> Result<()> {
        let mut manifest = self.manifest.lock().await;
        let mut next = manifest.clone();
        next.templates.insert(record.id.clone(), record);
        let (root, writer) = (self.root.clone(), self.writer.clone());
        *manifest = blocking(&self.root, move || next.save(&root, &writer).map(|()| next)).await?;
        Ok(())
    }
}

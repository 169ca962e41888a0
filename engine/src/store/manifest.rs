//! On-disk manifest of known templates.
//!
//! ## File Format
//! Path: `<cache_root>/manifest.json`
//! ```json
//! { "version": 1, "templates": { "<id>": { ...TemplateRecord } } }
//! ```
//! Rewritten atomically while holding an exclusive `fs2` lock on
//! `<cache_root>/.manifest.lock`, so two processes sharing a cache root
//! never interleave writes.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::atomic::AtomicWriter;
use crate::error::{EngineError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_LOCK_FILE: &str = ".manifest.lock";
pub const MANIFEST_VERSION: u32 = 1;

#[allow(clippy::expect_used)] // literal pattern
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$")
        .expect("valid version regex")
});

/// `MAJOR.MINOR.PATCH[-pre][+build]`
pub fn is_semver(version: &str) -> bool {
    VERSION_RE.is_match(version)
}

/// Whether the bytes behind a record last came from the local cache or
/// straight from origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOrigin {
    Cache,
    Remote,
}

/// Metadata for one cached template archive.
///
/// Records are never edited; a refresh or re-verification produces a new
/// record that replaces the old one in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub sha256: String,
    pub size: u64,
    /// Relative to the cache root.
    pub blob_path: PathBuf,
    pub verified_at: DateTime<Utc>,
    pub origin: RecordOrigin,
}

impl TemplateRecord {
    /// Absolute path of the blob under `root`.
    pub fn blob_in(&self, root: &Path) -> PathBuf {
        root.join(&self.blob_path)
    }

    /// A copy stamped as just verified from the local cache.
    pub fn reverified(&self) -> Self {
        Self {
            verified_at: Utc::now(),
            origin: RecordOrigin::Cache,
            ..self.clone()
        }
    }
}

/// Content-addressed blob location: `blobs/<first two hex chars>/<sha>.blob`.
pub fn blob_relpath(sha256: &str) -> PathBuf {
    let shard = sha256.get(..2).unwrap_or("00");
    PathBuf::from("blobs")
        .join(shard)
        .join(format!("{sha256}.blob"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            templates: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Read the manifest under `root`.
    ///
    /// A missing file is an empty manifest. A file that cannot be parsed (or
    /// carries an unknown version) is moved aside to
    /// `manifest.json.corrupt-<unix-ts>` and an empty manifest is returned;
    /// the cache is rebuilt from origin on demand.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(MANIFEST_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(EngineError::io(&path, err)),
        };

        let problem = match serde_json::from_slice::<Manifest>(&raw) {
            Ok(manifest) if manifest.version == MANIFEST_VERSION => return Ok(manifest),
            Ok(manifest) => format!("unsupported manifest version {}", manifest.version),
            Err(err) => err.to_string(),
        };

        let aside = root.join(format!(
            "{MANIFEST_FILE}.corrupt-{}",
            Utc::now().timestamp()
        ));
        fs::rename(&path, &aside).map_err(|e| EngineError::io(&path, e))?;
        tracing::warn!(
            manifest = %path.display(),
            moved_to = %aside.display(),
            corrupt_cache = true,
            "unreadable manifest moved aside ({problem}); starting with an empty cache"
        );
        Ok(Self::default())
    }

    /// Atomically rewrite the manifest under `root`.
    pub fn save(&self, root: &Path, writer: &AtomicWriter) -> Result<()> {
        let lock_path = root.join(MANIFEST_LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| EngineError::io(&lock_path, e))?;
        lock.lock_exclusive()
            .map_err(|e| EngineError::io(&lock_path, e))?;

        let body = serde_json::to_vec_pretty(self).map_err(|e| {
            EngineError::io(root.join(MANIFEST_FILE), io::Error::other(e))
        })?;
        let result = writer.write_one(&root.join(MANIFEST_FILE), &body);

        if let Err(err) = FileExt::unlock(&lock) {
            tracing::debug!(error = %err, "manifest lock release failed; dropped with the handle");
        }
        result
    }
}

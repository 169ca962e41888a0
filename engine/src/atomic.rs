//! Crash-safe writes.
//!
//! Uses the temp-file + fsync + rename pattern:
//! 1. Write to a temporary sibling in the same directory (same filesystem)
//! 2. fsync and re-read it to verify the bytes
//! 3. Rename (atomic on POSIX) over the target
//!
//! Batches stage every temporary first, back up every existing target, then
//! rename. A failure on any file restores the whole batch, so observers see
//! either the complete old tree or the complete new one.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
#[cfg(any(test, feature = "dev-faults"))]
use std::sync::Arc;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};
use uuid::Uuid;

use crate::error::{EngineError, Result};
#[cfg(any(test, feature = "dev-faults"))]
use crate::faults::FaultInjector;

#[cfg(any(test, feature = "dev-faults"))]
pub use crate::faults::FaultPoint;

#[cfg(not(any(test, feature = "dev-faults")))]
#[derive(Debug, Clone, Copy)]
enum FaultPoint {
    Stage,
    Commit,
    Swap,
}

/// One file in a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl WriteOp {
    pub fn new(path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
        }
    }
}

/// Writes files and directory trees so readers never observe partial state.
#[derive(Debug, Clone, Default)]
pub struct AtomicWriter {
    #[cfg(any(test, feature = "dev-faults"))]
    faults: Option<Arc<FaultInjector>>,
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a fault injector to every write step.
    #[cfg(any(test, feature = "dev-faults"))]
    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    #[cfg(any(test, feature = "dev-faults"))]
    fn inject(&self, point: FaultPoint, path: &Path) -> io::Result<()> {
        match &self.faults {
            Some(faults) => faults.check(point, path),
            None => Ok(()),
        }
    }

    #[cfg(not(any(test, feature = "dev-faults")))]
    fn inject(&self, _point: FaultPoint, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    /// Replace `path` with `bytes` atomically, creating parent directories.
    pub fn write_one(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = parent_of(path)?;
        let mut created = Vec::new();
        ensure_dir(parent, &mut created).map_err(|e| EngineError::io(parent, e))?;

        let outcome = self.stage(path, bytes).and_then(|tmp| {
            self.inject(FaultPoint::Commit, path)?;
            tmp.persist(path).map(drop).map_err(|e| e.error)
        });

        match outcome {
            Ok(()) => {
                sync_dir(parent);
                tracing::trace!(path = %path.display(), bytes = bytes.len(), "atomic write");
                Ok(())
            }
            Err(source) => {
                remove_created_dirs(&created);
                tracing::warn!(path = %path.display(), error = %source, "atomic write failed");
                Err(EngineError::WriteFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Apply every op or none of them.
    pub fn write_many(&self, ops: &[WriteOp]) -> Result<()> {
        let mut seen = HashSet::new();
        for op in ops {
            if !seen.insert(op.path.as_path()) {
                return Err(EngineError::invalid_change(format!(
                    "batch writes {} more than once",
                    op.path.display()
                )));
            }
        }

        let mut created = Vec::new();
        let result = self.write_batch(ops, &mut created);
        if let Err(err) = &result {
            remove_created_dirs(&created);
            tracing::warn!(files = ops.len(), error = %err, "batch write rolled back");
        } else {
            tracing::debug!(files = ops.len(), "batch write committed");
        }
        result
    }

    fn write_batch(&self, ops: &[WriteOp], created: &mut Vec<PathBuf>) -> Result<()> {
        // Phase 1: stage and verify every temporary
        let mut staged = Vec::with_capacity(ops.len());
        for op in ops {
            let parent = parent_of(&op.path)?;
            ensure_dir(parent, created).map_err(|source| EngineError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
            let tmp = self
                .stage(&op.path, &op.bytes)
                .map_err(|source| EngineError::WriteFailed {
                    path: op.path.clone(),
                    source,
                })?;
            staged.push(tmp);
        }

        // Phase 2: back up every target that already exists
        let mut backups = Vec::with_capacity(ops.len());
        for op in ops {
            let backup = backup_copy(&op.path).map_err(|source| EngineError::WriteFailed {
                path: op.path.clone(),
                source,
            })?;
            backups.push(backup);
        }

        // Phase 3: rename into place, restoring everything on the first failure
        for (index, (op, tmp)) in ops.iter().zip(staged).enumerate() {
            let outcome = self
                .inject(FaultPoint::Commit, &op.path)
                .and_then(|()| tmp.persist(&op.path).map(drop).map_err(|e| e.error));
            if let Err(source) = outcome {
                restore_batch(&ops[..index], backups);
                return Err(EngineError::WriteFailed {
                    path: op.path.clone(),
                    source,
                });
            }
        }

        let mut parents: Vec<&Path> = ops.iter().filter_map(|op| op.path.parent()).collect();
        parents.sort();
        parents.dedup();
        for parent in parents {
            sync_dir(parent);
        }
        Ok(())
    }

    fn stage(&self, target: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        let name = file_name_of(target);
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".tmp")
            .tempfile_in(parent)?;

        self.inject(FaultPoint::Stage, target)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;

        match fs::metadata(target) {
            Ok(meta) => fs::set_permissions(tmp.path(), meta.permissions())?,
            Err(_) => set_default_permissions(tmp.path())?,
        }

        let written = fs::read(tmp.path())?;
        if written != bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("verification of staged copy of {} failed", target.display()),
            ));
        }
        Ok(tmp)
    }

    /// Build a replacement tree beside `target`, then rename it into place.
    ///
    /// The previous tree is kept as a hidden backup sibling until the returned
    /// [`DirSwap`] is committed. If `build` fails, `target` is untouched.
    pub fn swap_dir<F>(&self, target: &Path, build: F) -> Result<DirSwap>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let parent = parent_of(target)?;
        fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        let name = file_name_of(target);

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{name}.staging-"))
            .tempdir_in(parent)
            .map_err(|e| EngineError::io(parent, e))?;

        build(staging.path())?;
        match fs::metadata(target) {
            Ok(meta) if meta.is_dir() => fs::set_permissions(staging.path(), meta.permissions()),
            _ => set_default_dir_permissions(staging.path()),
        }
        .map_err(|e| EngineError::io(staging.path(), e))?;

        let write_failed = |source| EngineError::WriteFailed {
            path: target.to_path_buf(),
            source,
        };
        self.inject(FaultPoint::Swap, target).map_err(write_failed)?;

        let backup = if target.exists() {
            let backup = parent.join(format!(".{name}.bak-{}", Uuid::new_v4().simple()));
            fs::rename(target, &backup).map_err(write_failed)?;
            Some(backup)
        } else {
            None
        };

        if let Err(source) = fs::rename(staging.path(), target) {
            if let Some(backup) = &backup
                && let Err(err) = fs::rename(backup, target)
            {
                tracing::error!(
                    target = %target.display(),
                    backup = %backup.display(),
                    error = %err,
                    "could not restore previous tree after failed swap"
                );
            }
            return Err(write_failed(source));
        }
        // The staging path now names the live tree; stop tempfile from deleting it.
        let _ = staging.keep();
        sync_dir(parent);

        Ok(DirSwap {
            target: target.to_path_buf(),
            backup,
            settled: false,
        })
    }
}

/// A directory swap awaiting confirmation.
///
/// Dropping it without calling [`DirSwap::commit`] restores the previous tree.
#[must_use = "an uncommitted swap is rolled back on drop"]
#[derive(Debug)]
pub struct DirSwap {
    target: PathBuf,
    backup: Option<PathBuf>,
    settled: bool,
}

impl DirSwap {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Hidden sibling holding the previous tree, if there was one.
    pub fn backup(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    /// Keep the new tree and discard the backup.
    pub fn commit(mut self) {
        self.settled = true;
        if let Some(backup) = self.backup.take()
            && let Err(err) = fs::remove_dir_all(&backup)
        {
            tracing::warn!(
                backup = %backup.display(),
                error = %err,
                "swap committed but the backup tree could not be removed"
            );
        }
    }

    /// Discard the new tree and put the previous one back.
    pub fn rollback(mut self) -> Result<()> {
        self.settled = true;
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.target) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(EngineError::io(&self.target, err)),
        }
        if let Some(backup) = self.backup.take() {
            fs::rename(&backup, &self.target).map_err(|e| EngineError::io(&backup, e))?;
        }
        Ok(())
    }
}

impl Drop for DirSwap {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(target = %self.target.display(), "uncommitted directory swap rolled back");
            if let Err(err) = self.restore() {
                tracing::error!(target = %self.target.display(), error = %err, "rollback failed");
            }
        }
    }
}

fn parent_of(path: &Path) -> Result<&Path> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent),
        Some(_) => Ok(Path::new(".")),
        None => Err(EngineError::InvalidDestination {
            path: path.to_path_buf(),
            reason: "path has no parent directory".to_string(),
        }),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "entry".to_string())
}

/// Create `dir` and any missing ancestors, recording what was created.
fn ensure_dir(dir: &Path, created: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(current) = cursor {
        if current.as_os_str().is_empty() || current.exists() {
            break;
        }
        missing.push(current.to_path_buf());
        cursor = current.parent();
    }
    for dir in missing.into_iter().rev() {
        match fs::create_dir(&dir) {
            Ok(()) => created.push(dir),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn remove_created_dirs(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        // only empty directories go; anything else was not ours
        let _ = fs::remove_dir(dir);
    }
}

fn backup_copy(target: &Path) -> io::Result<Option<TempPath>> {
    if !target.is_file() {
        return Ok(None);
    }
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let backup = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name_of(target)))
        .suffix(".bak")
        .tempfile_in(parent)?
        .into_temp_path();
    fs::copy(target, &backup)?;
    Ok(Some(backup))
}

fn restore_batch(committed: &[WriteOp], backups: Vec<Option<TempPath>>) {
    for (op, backup) in committed.iter().zip(backups) {
        let restored = match backup {
            Some(backup) => backup.persist(&op.path).map_err(|e| e.error),
            None => fs::remove_file(&op.path),
        };
        if let Err(err) = restored {
            tracing::error!(path = %op.path.display(), error = %err, "failed to restore file during rollback");
        }
    }
}

#[cfg(unix)]
fn set_default_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_default_dir_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_default_dir_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Run filesystem work on the runtime's blocking pool. A task that dies
/// surfaces as an I/O error on `path`.
pub(crate) async fn blocking<T, F>(path: &Path, op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| EngineError::io(path, io::Error::other(e)))?
}

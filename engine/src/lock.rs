//! Exclusive, time-bounded ownership of destination directories.
//!
//! ## Design
//! - One process-wide registry keyed by normalized absolute directory path
//! - Acquisition never blocks: a live handle means `CONFLICT_EXISTS` now
//! - Every handle expires after the configured TTL; an expired entry is
//!   replaced on the next acquire and removed by the periodic sweep
//! - `with_lock` releases through a guard, so errors and panics cannot leak
//!   a handle

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{EngineError, Result};

// =============================================================================
// LockHandle
// =============================================================================

/// Proof of ownership of one directory until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    dir: PathBuf,
    owner: Uuid,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockHandle {
    /// Normalized absolute directory this handle covers.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Debug)]
struct LockEntry {
    owner: Uuid,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    /// `None` when the TTL reaches past what `Instant` can represent.
    deadline: Option<Instant>,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| now < deadline)
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.deadline
            .map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(now))
    }
}

// =============================================================================
// LockManager
// =============================================================================

/// In-memory registry of directory locks.
#[derive(Debug)]
pub struct LockManager {
    ttl: Duration,
    registry: Mutex<HashMap<PathBuf, LockEntry>>,
}

impl LockManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<PathBuf, LockEntry>> {
        // The map holds no invariants a panicking holder could break.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `dir`, or fail immediately if someone else holds it.
    pub fn acquire(&self, dir: &Path) -> Result<LockHandle> {
        let key = normalize_dir(dir)?;
        let now = Instant::now();
        let mut registry = self.registry();

        if let Some(entry) = registry.get(&key) {
            if entry.is_live(now) {
                let retry_after = entry.remaining(now);
                tracing::debug!(
                    dir = %key.display(),
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "directory busy"
                );
                return Err(EngineError::Locked {
                    path: key,
                    acquired_at: entry.acquired_at,
                    expires_at: entry.expires_at,
                    retry_after,
                });
            }
            tracing::debug!(dir = %key.display(), "replacing expired lock");
        }

        let acquired_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| acquired_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let owner = Uuid::new_v4();
        registry.insert(
            key.clone(),
            LockEntry {
                owner,
                acquired_at,
                expires_at,
                deadline: now.checked_add(self.ttl),
            },
        );
        drop(registry);

        tracing::debug!(dir = %key.display(), %owner, "lock acquired");
        Ok(LockHandle {
            dir: key,
            owner,
            acquired_at,
            expires_at,
        })
    }

    /// Release `handle`. Returns `false` when the handle is stale: it expired
    /// and the directory was swept or re-acquired by someone else.
    pub fn release(&self, handle: &LockHandle) -> bool {
        let mut registry = self.registry();
        let owned = registry
            .get(&handle.dir)
            .is_some_and(|entry| entry.owner == handle.owner);
        if owned {
            registry.remove(&handle.dir);
            tracing::debug!(dir = %handle.dir.display(), owner = %handle.owner, "lock released");
        } else {
            tracing::debug!(dir = %handle.dir.display(), owner = %handle.owner, "stale lock handle");
        }
        owned
    }

    /// Whether a live handle exists for `dir`.
    pub fn is_locked(&self, dir: &Path) -> Result<bool> {
        let key = normalize_dir(dir)?;
        let now = Instant::now();
        Ok(self
            .registry()
            .get(&key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    /// Remove every expired handle, returning how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut registry = self.registry();
        let before = registry.len();
        registry.retain(|_, entry| entry.is_live(now));
        before - registry.len()
    }

    /// Run [`LockManager::sweep_expired`] every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("lock sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = manager.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired directory locks");
                        }
                    }
                }
            }
        })
    }

    /// Acquire `dir` and return a guard that releases it on drop.
    pub fn guard(&self, dir: &Path) -> Result<LockGuard<'_>> {
        let handle = self.acquire(dir)?;
        Ok(LockGuard {
            manager: self,
            handle,
        })
    }

    /// Run `op` while holding `dir`. The lock is released whether `op`
    /// succeeds, fails or panics.
    pub fn with_lock<T, F>(&self, dir: &Path, op: F) -> Result<T>
    where
        F: FnOnce(&LockHandle) -> Result<T>,
    {
        let guard = self.guard(dir)?;
        op(guard.handle())
    }

    /// Async form of [`LockManager::with_lock`].
    pub async fn with_lock_async<T, F, Fut>(&self, dir: &Path, op: F) -> Result<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.guard(dir)?;
        op(guard.handle().clone()).await
    }
}

// =============================================================================
// LockGuard
// =============================================================================

/// Releases its handle when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    handle: LockHandle,
}

impl LockGuard<'_> {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.handle);
    }
}

// =============================================================================
// Path normalization
// =============================================================================

/// Resolve `dir` to the key used in the registry.
///
/// The path is made absolute, `.` and `..` are folded lexically, and the
/// longest existing ancestor is canonicalized (symlinks resolved) before the
/// not-yet-existing remainder is re-appended. Two spellings of the same
/// directory yield the same key even before the directory exists.
pub fn normalize_dir(dir: &Path) -> Result<PathBuf> {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| EngineError::io(dir, e))?
            .join(dir)
    };

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other.as_os_str()),
        }
    }

    let mut existing = lexical.as_path();
    let mut remainder = Vec::new();
    loop {
        if let Ok(canonical) = dunce::canonicalize(existing) {
            let mut key = canonical;
            for part in remainder.iter().rev() {
                key.push(part);
            }
            return Ok(key);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(lexical),
        }
    }
}

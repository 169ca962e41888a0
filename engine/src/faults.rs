//! Fault injection for the write path.
//!
//! Lets tests (and `dev-faults` builds) fail the Nth staging, commit or
//! directory-swap step of the atomic writer, so rollback paths can be
//! exercised deterministically.
//!
//! ## Configuration via Environment Variables (`dev-faults` only)
//! ```bash
//! TPLFORGE_FAULTS=commit:2,stage:1   # fail the 2nd rename and the 1st staged temp file
//! ```

// Note: #[cfg(any(test, feature = "dev-faults"))] is specified at the module inclusion site (lib.rs)

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Step of the atomic writer a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Writing a sibling temporary file.
    Stage,
    /// Renaming a staged temporary over its target.
    Commit,
    /// Renaming a staged directory tree into place.
    Swap,
}

#[derive(Debug, Default)]
struct Trigger {
    /// 1-based occurrence that fails; 0 means disarmed.
    nth: AtomicUsize,
    seen: AtomicUsize,
}

/// Counts write steps and fails the configured occurrence.
#[derive(Debug, Default)]
pub struct FaultInjector {
    stage: Trigger,
    commit: Trigger,
    swap: Trigger,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `nth` (1-based) occurrence of `point`.
    pub fn fail_at(self, point: FaultPoint, nth: usize) -> Self {
        self.trigger(point).nth.store(nth, Ordering::SeqCst);
        self.trigger(point).seen.store(0, Ordering::SeqCst);
        self
    }

    /// Injector armed by `TPLFORGE_FAULTS`, if set. [`Engine::from_config`]
    /// hands it to every writer.
    ///
    /// [`Engine::from_config`]: crate::Engine::from_config
    #[cfg(feature = "dev-faults")]
    pub fn from_env() -> Option<Self> {
        let spec = std::env::var("TPLFORGE_FAULTS").ok()?;
        tracing::info!("[faults] Write-path faults armed from TPLFORGE_FAULTS={spec}");
        Some(Self::parse(&spec))
    }

    /// Parse `commit:2,stage:1`. Unknown points and bad counts are skipped.
    pub fn parse(spec: &str) -> Self {
        let mut injector = Self::new();
        for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((label, count)) = entry.split_once(':') else {
                tracing::warn!("[faults] Ignoring malformed fault entry: {entry}");
                continue;
            };
            let Ok(nth) = count.trim().parse::<usize>() else {
                tracing::warn!("[faults] Ignoring bad count in fault entry: {entry}");
                continue;
            };
            let point = match label.trim() {
                "stage" => FaultPoint::Stage,
                "commit" => FaultPoint::Commit,
                "swap" => FaultPoint::Swap,
                _ => {
                    tracing::warn!("[faults] Unknown fault point: {label}");
                    continue;
                }
            };
            injector = injector.fail_at(point, nth);
        }
        injector
    }

    fn trigger(&self, point: FaultPoint) -> &Trigger {
        match point {
            FaultPoint::Stage => &self.stage,
            FaultPoint::Commit => &self.commit,
            FaultPoint::Swap => &self.swap,
        }
    }

    /// Record one occurrence of `point`; error if it is the armed one.
    pub fn check(&self, point: FaultPoint, path: &Path) -> io::Result<()> {
        let trigger = self.trigger(point);
        let nth = trigger.nth.load(Ordering::SeqCst);
        if nth == 0 {
            return Ok(());
        }
        let seen = trigger.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == nth {
            tracing::warn!(
                "[faults] Injecting {point:?} failure #{nth} on {}",
                path.display()
            );
            return Err(io::Error::other(format!(
                "{point:?} failed on {} (fault injected)",
                path.display()
            )));
        }
        Ok(())
    }

    /// Occurrences of `point` observed so far (for diagnostics).
    pub fn seen(&self, point: FaultPoint) -> usize {
        self.trigger(point).seen.load(Ordering::SeqCst)
    }
}

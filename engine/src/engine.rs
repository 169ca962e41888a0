//! Public facade.
//!
//! [`Engine`] wires the store, lock manager, extractor and operators
//! together and turns every outcome into an [`Envelope`]. Nothing below
//! this layer returns an envelope and nothing above it sees an
//! [`EngineError`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{ExtractOptions, ExtractionResult, Extractor};
use crate::atomic::{AtomicWriter, blocking};
use crate::blueprint::{Blueprint, StructuralValidator, Step};
use crate::config::EngineConfig;
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::lock::LockManager;
use crate::mutate::{
    ComponentChange, ComponentInserter, MutationOptions, MutationResult, Mutator, SlotChange,
    SlotFiller, ThemeChange, ThemeRewriter,
};
use crate::store::{IntegrityStore, MirrorOrigin, Resolved, TemplateOrigin};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeOptions {
    /// Replace a non-empty destination.
    pub overwrite: bool,
    /// Validate everything, write nothing.
    pub simulate: bool,
    /// Ask origin even when the cache has a verified copy.
    pub force_refresh: bool,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<IntegrityStore>,
    locks: Arc<LockManager>,
    extractor: Extractor,
    slots: SlotFiller,
    themes: ThemeRewriter,
    components: ComponentInserter,
    validator: Option<Arc<dyn StructuralValidator>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, origin: Arc<dyn TemplateOrigin>) -> Result<Self> {
        Self::with_writer(config, origin, AtomicWriter::new())
    }

    /// Engine whose origin is the mirror directory from `config`
    /// (`<cache_root>/mirror` when none is set). `dev-faults` builds also
    /// arm the writers from `TPLFORGE_FAULTS`.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let mirror = config
            .origin
            .mirror_dir
            .clone()
            .unwrap_or_else(|| config.cache_root.join("mirror"));
        let writer = AtomicWriter::new();
        #[cfg(feature = "dev-faults")]
        let writer = match crate::faults::FaultInjector::from_env() {
            Some(faults) => writer.with_faults(Arc::new(faults)),
            None => writer,
        };
        Self::with_writer(config, Arc::new(MirrorOrigin::new(mirror)), writer)
    }

    /// Route every write through `writer`.
    pub fn with_writer(
        config: EngineConfig,
        origin: Arc<dyn TemplateOrigin>,
        writer: AtomicWriter,
    ) -> Result<Self> {
        config.validate()?;
        let store = IntegrityStore::open(config.cache_root.clone(), origin, config.origin.clone())?
            .with_writer(writer.clone());
        Ok(Self {
            store: Arc::new(store),
            locks: Arc::new(LockManager::from_config(&config.locks)),
            extractor: Extractor::new(config.limits).with_writer(writer.clone()),
            slots: SlotFiller::new(&config.scan).with_writer(writer.clone()),
            themes: ThemeRewriter::new(&config.theme).with_writer(writer.clone()),
            components: ComponentInserter::new(&config.scan).with_writer(writer),
            validator: None,
            config,
        })
    }

    pub fn with_validator(mut self, validator: Arc<dyn StructuralValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<IntegrityStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Start the expired-lock sweeper on the current runtime.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.locks
            .spawn_sweeper(self.config.locks.sweep_interval(), cancel)
    }

    // ---------------------------------------------------------------------
    // Materialization
    // ---------------------------------------------------------------------

    /// Resolve `template_id` and unpack it into `dest`.
    pub async fn materialize(
        &self,
        template_id: &str,
        dest: &Path,
        options: MaterializeOptions,
    ) -> Envelope {
        let started = Instant::now();
        let result = self.resolve_and_extract(template_id, dest, options).await;
        Envelope::from_result("materialize", result, |(resolved, extraction)| {
            materialized(&resolved, dest, &extraction, started)
        })
    }

    async fn resolve_and_extract(
        &self,
        template_id: &str,
        dest: &Path,
        options: MaterializeOptions,
    ) -> Result<(Resolved, ExtractionResult)> {
        let resolved = self.store.resolve(template_id, options.force_refresh).await?;
        let extraction = self
            .extract_locked(
                resolved.bytes.clone(),
                dest,
                ExtractOptions {
                    overwrite: options.overwrite,
                    simulate: options.simulate,
                },
            )
            .await?;
        Ok((resolved, extraction))
    }

    /// Extract on the blocking pool while holding the lock on `dest`.
    async fn extract_locked(
        &self,
        bytes: Vec<u8>,
        dest: &Path,
        options: ExtractOptions,
    ) -> Result<ExtractionResult> {
        let locks = Arc::clone(&self.locks);
        let extractor = self.extractor.clone();
        let target = dest.to_path_buf();
        blocking(dest, move || {
            locks.with_lock(&target, |_| extractor.extract(&bytes, &target, options))
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    pub fn fill_slot(&self, root: &Path, change: &SlotChange, options: MutationOptions) -> Envelope {
        self.mutate(&self.slots, root, change, options)
    }

    pub fn rewrite_theme(
        &self,
        root: &Path,
        change: &ThemeChange,
        options: MutationOptions,
    ) -> Envelope {
        self.mutate(&self.themes, root, change, options)
    }

    pub fn insert_component(
        &self,
        root: &Path,
        change: &ComponentChange,
        options: MutationOptions,
    ) -> Envelope {
        self.mutate(&self.components, root, change, options)
    }

    fn mutate<M: Mutator>(
        &self,
        mutator: &M,
        root: &Path,
        change: &M::Change,
        options: MutationOptions,
    ) -> Envelope {
        let result = apply_locked(&self.locks, mutator, root, change, options);
        Envelope::from_result(mutator.name(), result, Envelope::from_mutation)
    }

    /// One blueprint step, on the blocking pool.
    async fn apply_step<M>(&self, mutator: &M, root: &Path, change: &M::Change) -> Result<MutationResult>
    where
        M: Mutator + Clone + Send + 'static,
        M::Change: Clone + Send + 'static,
    {
        let locks = Arc::clone(&self.locks);
        let mutator = mutator.clone();
        let change = change.clone();
        let target = root.to_path_buf();
        blocking(root, move || {
            apply_locked(&locks, &mutator, &target, &change, MutationOptions::default())
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Read-only
    // ---------------------------------------------------------------------

    pub async fn list_templates(&self) -> Envelope {
        let started = Instant::now();
        let templates = self.store.list_known().await;
        Envelope::read_only(json!({ "templates": templates }), started.elapsed())
    }

    pub async fn store_stats(&self) -> Envelope {
        let started = Instant::now();
        let stats = self.store.stats().await;
        Envelope::read_only(
            json!({
                "cache_root": self.store.root(),
                "entries": stats.entries,
                "total_bytes": stats.total_bytes,
            }),
            started.elapsed(),
        )
    }

    // ---------------------------------------------------------------------
    // Blueprints
    // ---------------------------------------------------------------------

    /// Validate `document`, materialize its template into `dest` and apply
    /// its steps in order.
    ///
    /// With `simulate`, the template is unpacked into a scratch directory
    /// and the steps run there, so the report reflects real results while
    /// `dest` stays untouched.
    pub async fn run_blueprint(&self, document: &Value, dest: &Path, simulate: bool) -> Envelope {
        let started = Instant::now();
        let blueprint = match Blueprint::from_document(document, self.validator.as_deref()) {
            Ok(blueprint) => blueprint,
            Err(err) => return Envelope::failure("run_blueprint", &err),
        };

        let options = MaterializeOptions {
            overwrite: blueprint.overwrite,
            simulate,
            force_refresh: blueprint.force_refresh,
        };
        let (resolved, extraction) = match self
            .resolve_and_extract(&blueprint.template, dest, options)
            .await
        {
            Ok(done) => done,
            Err(err) => return Envelope::failure("run_blueprint", &err),
        };

        let scratch = if simulate {
            match self.scratch_copy(&resolved, dest).await {
                Ok(scratch) => Some(scratch),
                Err(err) => return Envelope::failure("run_blueprint", &err),
            }
        } else {
            None
        };
        let root: PathBuf = scratch
            .as_ref()
            .map_or_else(|| dest.to_path_buf(), |dir| dir.path().to_path_buf());

        let mut changed_files: Vec<String> = extraction.files.clone();
        let mut seen: BTreeSet<String> = changed_files.iter().cloned().collect();
        let mut warnings = resolved.warnings.clone();
        let mut reports = Vec::with_capacity(blueprint.steps.len());
        let mut changed = !extraction.files.is_empty() || !extraction.directories.is_empty();

        for (index, step) in blueprint.steps.iter().enumerate() {
            let outcome = match step {
                Step::FillSlot(change) => self.apply_step(&self.slots, &root, change).await,
                Step::RewriteTheme(change) => self.apply_step(&self.themes, &root, change).await,
                Step::InsertComponent(change) => {
                    self.apply_step(&self.components, &root, change).await
                }
            };
            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    return Envelope::failure("run_blueprint", &err)
                        .with_detail("step", json!(index))
                        .with_detail("op", json!(step.op()))
                        .with_detail("changed_files", json!(changed_files));
                }
            };

            changed |= result.changed;
            for file in &result.files_written {
                if seen.insert(file.clone()) {
                    changed_files.push(file.clone());
                }
            }
            warnings.extend(result.warnings.iter().map(ToString::to_string));
            reports.push(json!({
                "op": step.op(),
                "changed": result.changed,
                "files_written": result.files_written,
            }));
        }

        tracing::info!(
            template = %blueprint.template,
            dest = %dest.display(),
            steps = reports.len(),
            simulate,
            "blueprint applied"
        );

        let mut envelope = Envelope::success(changed, changed_files, started.elapsed())
            .with_warnings(warnings)
            .with_data(json!({
                "template": resolved.record.id,
                "version": resolved.record.version,
                "sha256": resolved.record.sha256,
                "dest": dest,
                "steps": reports,
            }));
        if let Envelope::Success(success) = &mut envelope {
            success.simulated = simulate;
        }
        envelope
    }

    /// Unpack `resolved` into a fresh temporary directory.
    async fn scratch_copy(&self, resolved: &Resolved, dest: &Path) -> Result<tempfile::TempDir> {
        let scratch = tempfile::Builder::new()
            .prefix("tplforge-simulate-")
            .tempdir()
            .map_err(|e| EngineError::io(dest, e))?;
        self.extract_locked(
            resolved.bytes.clone(),
            scratch.path(),
            ExtractOptions {
                overwrite: true,
                simulate: false,
            },
        )
        .await?;
        Ok(scratch)
    }
}

fn materialized(
    resolved: &Resolved,
    dest: &Path,
    extraction: &ExtractionResult,
    started: Instant,
) -> Envelope {
    let changed = !extraction.files.is_empty() || !extraction.directories.is_empty();
    let mut envelope = Envelope::success(changed, extraction.files.clone(), started.elapsed())
        .with_warnings(resolved.warnings.iter().cloned())
        .with_data(json!({
            "template": resolved.record.id,
            "name": resolved.record.name,
            "version": resolved.record.version,
            "sha256": resolved.record.sha256,
            "origin": resolved.record.origin,
            "dest": dest,
            "directories": extraction.directories,
            "total_bytes": extraction.total_bytes,
        }));
    if let Envelope::Success(success) = &mut envelope {
        success.simulated = extraction.simulated;
    }
    envelope
}

fn apply_locked<M: Mutator>(
    locks: &LockManager,
    mutator: &M,
    root: &Path,
    change: &M::Change,
    options: MutationOptions,
) -> Result<MutationResult> {
    let result = locks.with_lock(root, |_| mutator.apply(root, change, options))?;
    tracing::info!(
        operation = mutator.name(),
        root = %root.display(),
        changed = result.changed,
        files = result.files_written.len(),
        simulated = result.simulated,
        "mutation applied"
    );
    Ok(result)
}

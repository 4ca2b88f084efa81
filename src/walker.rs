//! Recursive tree traversal
//!
//! [`TreeWalker`] drives one batch over the source tree. For each directory
//! it lists and classifies the entries, dispatches the leaf items through
//! the resume gate and the chunked scheduler, and then visits the
//! subdirectories and archives one at a time in natural order.
//!
//! ## Hierarchy
//!
//! The depth of an entry maps to a [`HierarchyLevel`] through the
//! configured schema. App and Variant directories follow the same state
//! machine:
//!
//! - completed already: skipped without recursion
//! - otherwise: marked running, walked, then marked completed (or failed
//!   under [`CompletionPolicy::RequireSuccess`] when something below failed)
//!
//! Leaves found under an App with no Variant are attributed to the
//! configured default Variant. That Variant is opened on the first such
//! leaf and closed together with its App.
//!
//! A directory left behind by an interrupted archive splice is not walked
//! on its own; the archive next to it splices it again.
//!
//! ## Output mirror
//!
//! Each leaf is written to `output_root/<path relative to source_root>`,
//! creating parent directories right before the item is processed.

use crate::archive::ArchiveStage;
use crate::config::CompletionPolicy;
use crate::engine::PipelineContext;
use crate::error::{ProcessingError, Result};
use crate::classifier::PathClassifier;
use crate::resume::Decision;
use crate::types::{
    DirectoryEntry, EntryKind, ErrorContext, HierarchyLevel, ProgressInfo, ProgressKey,
    TraversalContext, WalkSummary,
};
use crate::utils::mirror_path;
use futures::future::{FutureExt, LocalBoxFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, trace, warn};

/// Per-run state of a synthesized default Variant
#[derive(Debug, Clone, Copy, Default)]
struct DefaultVariant {
    skipped: bool,
    failed: bool,
}

/// Outcome of one leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafOutcome {
    Processed,
    Failed,
}

/// One batch traversal over a pipeline context
pub struct TreeWalker<'a> {
    pipeline: &'a PipelineContext,
    processed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    defaults: Mutex<HashMap<String, DefaultVariant>>,
}

impl<'a> TreeWalker<'a> {
    /// Create a walker for one run
    pub fn new(pipeline: &'a PipelineContext) -> Self {
        Self {
            pipeline,
            processed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            defaults: Mutex::new(HashMap::new()),
        }
    }

    /// Walk the whole source tree
    pub async fn run(&self) -> Result<WalkSummary> {
        let root = self.pipeline.source_root.clone();
        info!("Walking {:?} into {:?}", root, self.pipeline.output_root);
        let summary = self.walk(root, 0, TraversalContext::default()).await?;
        info!(
            "Walk finished: {} processed, {} skipped, {} failed",
            summary.processed, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    /// Visit every entry of `dir`; entries inside sit at `depth`
    pub fn walk(
        &self,
        dir: PathBuf,
        depth: usize,
        ctx: TraversalContext,
    ) -> LocalBoxFuture<'_, Result<WalkSummary>> {
        async move {
            let mut summary = WalkSummary::default();

            let entries = match self.read_entries(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Cannot list {:?}: {}", dir, e);
                    self.pipeline.store.log_error(
                        e.to_string(),
                        None,
                        ErrorContext::new("scan", Some(&dir)).within(&ctx),
                    )?;
                    summary.failed += 1;
                    return Ok(summary);
                }
            };

            let (leaves, containers): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .partition(|e| e.kind == EntryKind::Leaf);

            if !leaves.is_empty() {
                summary.merge(&self.process_leaves(leaves, &ctx).await?);
            }

            for entry in containers {
                if entry.kind == EntryKind::Directory
                    && ArchiveStage::is_unfinished_splice(&entry.path).await
                {
                    debug!("Leaving {:?} to its archive", entry.path);
                    continue;
                }
                let sub = match entry.kind {
                    EntryKind::Directory => self.visit_directory(entry, depth, &ctx).await?,
                    EntryKind::Archive => {
                        self.pipeline
                            .archives
                            .splice(&entry.path, &ctx, |extracted| {
                                self.walk(extracted, depth, ctx.clone())
                            })
                            .await?
                    }
                    EntryKind::Leaf | EntryKind::Ignored => continue,
                };
                summary.merge(&sub);
            }

            Ok(summary)
        }
        .boxed_local()
    }

    async fn read_entries(&self, dir: &Path) -> Result<Vec<DirectoryEntry>> {
        let classifier = &self.pipeline.classifier;
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(dir).await?;

        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if classifier.is_reserved(&name) {
                continue;
            }

            let file_type = entry.file_type().await?;
            let is_dir = if file_type.is_symlink() {
                match tokio::fs::metadata(entry.path()).await {
                    Ok(meta) => meta.is_dir(),
                    Err(e) => {
                        debug!("Skipping dangling link {:?}: {}", entry.path(), e);
                        continue;
                    }
                }
            } else {
                file_type.is_dir()
            };

            let classified = classifier.classify(&entry.path(), is_dir);
            if classified.kind != EntryKind::Ignored {
                entries.push(classified);
            } else {
                trace!("Ignoring {:?}", classified.path);
            }
        }

        PathClassifier::sort_entries(&mut entries);
        Ok(entries)
    }

    async fn visit_directory(
        &self,
        entry: DirectoryEntry,
        depth: usize,
        ctx: &TraversalContext,
    ) -> Result<WalkSummary> {
        let level = self.pipeline.classifier.level_for_depth(depth);
        let child_ctx = ctx.descend(level, &entry.name);

        match level {
            HierarchyLevel::App => self.visit_app(entry, depth, child_ctx).await,
            HierarchyLevel::Variant if ctx.app.is_some() => {
                self.visit_variant(entry, depth, child_ctx).await
            }
            _ => self.walk(entry.path, depth + 1, child_ctx).await,
        }
    }

    async fn visit_app(
        &self,
        entry: DirectoryEntry,
        depth: usize,
        ctx: TraversalContext,
    ) -> Result<WalkSummary> {
        let agent = self.pipeline.store.agent();
        let key = ProgressKey::app(agent, &entry.name);
        let mut summary = WalkSummary::default();

        if self.pipeline.gate.decide(&key) == Decision::Skip {
            info!("Skipping completed app {}", entry.name);
            summary.apps_skipped += 1;
            return Ok(summary);
        }

        self.pipeline.store.mark_started(&key)?;
        info!("Processing app {}", entry.name);

        summary.merge(&self.walk(entry.path, depth + 1, ctx.clone()).await?);

        if let Some(default) = &self.pipeline.config.default_variant {
            let default_key = ProgressKey::variant(agent, &entry.name, default);
            let state = self.defaults.lock().remove(default_key.as_str());
            if let Some(state) = state.filter(|s| !s.skipped) {
                if self.close_scope(&default_key, state.failed)? {
                    summary.variants_completed += 1;
                }
            }
        }

        if self.close_scope(&key, summary.has_failures())? {
            summary.apps_completed += 1;
            info!("Completed app {}", entry.name);
        }
        Ok(summary)
    }

    async fn visit_variant(
        &self,
        entry: DirectoryEntry,
        depth: usize,
        ctx: TraversalContext,
    ) -> Result<WalkSummary> {
        let app = ctx.app.clone().unwrap_or_default();
        let key = ProgressKey::variant(self.pipeline.store.agent(), &app, &entry.name);
        let mut summary = WalkSummary::default();

        if self.pipeline.gate.decide(&key) == Decision::Skip {
            info!("Skipping completed variant {}/{}", app, entry.name);
            summary.variants_skipped += 1;
            return Ok(summary);
        }

        self.pipeline.store.mark_started(&key)?;
        debug!("Processing variant {}/{}", app, entry.name);

        summary.merge(&self.walk(entry.path, depth + 1, ctx).await?);

        if self.close_scope(&key, summary.has_failures())? {
            summary.variants_completed += 1;
            info!("Completed variant {}/{}", app, entry.name);
        }
        Ok(summary)
    }

    /// Close an App or Variant according to the completion policy
    ///
    /// Returns whether the scope ended completed.
    fn close_scope(&self, key: &ProgressKey, had_failures: bool) -> Result<bool> {
        let store = &self.pipeline.store;
        if had_failures && self.pipeline.config.completion_policy == CompletionPolicy::RequireSuccess {
            store.mark_failed(key, "one or more items below failed")?;
            warn!("Leaving {} failed for the next run", key);
            return Ok(false);
        }
        store.mark_completed(key)?;
        Ok(true)
    }

    /// Context for leaves of a directory, opening the default Variant if needed
    ///
    /// Returns `None` if the leaves belong to a default Variant that is
    /// already completed.
    fn leaf_context(&self, ctx: &TraversalContext) -> Result<Option<(TraversalContext, Option<String>)>> {
        let (Some(app), None, Some(default)) = (
            ctx.app.as_deref(),
            ctx.variant.as_deref(),
            self.pipeline.config.default_variant.as_deref(),
        ) else {
            return Ok(Some((ctx.clone(), None)));
        };

        let key = ProgressKey::variant(self.pipeline.store.agent(), app, default);
        let known = self.defaults.lock().get(key.as_str()).copied();
        let state = match known {
            Some(state) => state,
            None => {
                let skipped = self.pipeline.gate.decide(&key) == Decision::Skip;
                if skipped {
                    info!("Skipping completed variant {}/{}", app, default);
                } else {
                    self.pipeline.store.mark_started(&key)?;
                    debug!("Opened default variant {}/{}", app, default);
                }
                let state = DefaultVariant {
                    skipped,
                    failed: false,
                };
                self.defaults.lock().insert(key.as_str().to_string(), state);
                state
            }
        };

        if state.skipped {
            return Ok(None);
        }
        Ok(Some((ctx.with_variant(default), Some(key.as_str().to_string()))))
    }

    async fn process_leaves(
        &self,
        leaves: Vec<DirectoryEntry>,
        ctx: &TraversalContext,
    ) -> Result<WalkSummary> {
        let mut summary = WalkSummary::default();

        let Some((leaf_ctx, default_key)) = self.leaf_context(ctx)? else {
            summary.skipped += leaves.len();
            for entry in &leaves {
                self.settle_skip(entry);
            }
            return Ok(summary);
        };

        let agent = self.pipeline.store.agent();
        let keyed: Vec<(ProgressKey, DirectoryEntry)> = leaves
            .into_iter()
            .map(|entry| (ProgressKey::image(agent, &entry.path), entry))
            .collect();

        let (done, pending) = self.pipeline.gate.partition(keyed);
        summary.skipped += done.len();
        for (_, entry) in &done {
            trace!("Skipping completed {:?}", entry.path);
            self.settle_skip(entry);
        }

        let outcomes = self
            .pipeline
            .scheduler
            .run(pending, |(key, entry)| self.process_leaf(key, entry, &leaf_ctx))
            .await;

        for outcome in outcomes {
            match outcome? {
                LeafOutcome::Processed => summary.processed += 1,
                LeafOutcome::Failed => summary.failed += 1,
            }
        }

        if summary.failed > 0 {
            if let Some(key) = default_key {
                if let Some(state) = self.defaults.lock().get_mut(&key) {
                    state.failed = true;
                }
            }
        }
        Ok(summary)
    }

    async fn process_leaf(
        &self,
        key: ProgressKey,
        entry: DirectoryEntry,
        ctx: &TraversalContext,
    ) -> Result<LeafOutcome> {
        let store = &self.pipeline.store;
        store.mark_started(&key)?;

        let outcome = match self.transform(&entry.path).await {
            Ok(output) => {
                store.mark_completed(&key)?;
                debug!("Processed {:?} -> {:?}", entry.path, output);
                self.processed.fetch_add(1, Ordering::SeqCst);
                LeafOutcome::Processed
            }
            Err(e) => {
                warn!("Failed to process {:?}: {}", entry.path, e);
                store.mark_failed(&key, &e.to_string())?;
                store.log_error(
                    e.to_string(),
                    Some(format!("{:?}", e)),
                    ErrorContext::new(self.pipeline.config.action.clone(), Some(&entry.path))
                        .within(ctx),
                )?;
                self.failed.fetch_add(1, Ordering::SeqCst);
                LeafOutcome::Failed
            }
        };

        self.emit(&entry);
        Ok(outcome)
    }

    async fn transform(&self, input: &Path) -> std::result::Result<PathBuf, ProcessingError> {
        let destination = mirror_path(input, &self.pipeline.source_root, &self.pipeline.output_root)
            .map_err(|e| ProcessingError::downstream(input, e))?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProcessingError::downstream(input, e))?;
        }
        self.pipeline.processor.process(input, &destination).await
    }

    fn settle_skip(&self, entry: &DirectoryEntry) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.emit(entry);
    }

    fn emit(&self, entry: &DirectoryEntry) {
        if let Some(callback) = &self.pipeline.on_progress {
            callback(ProgressInfo {
                operation: self.pipeline.config.action.clone(),
                current_item: Some(entry.path.display().to_string()),
                processed: self.processed.load(Ordering::SeqCst),
                skipped: self.skipped.load(Ordering::SeqCst),
                failed: self.failed.load(Ordering::SeqCst),
            });
        }
    }
}

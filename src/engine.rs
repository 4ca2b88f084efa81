//! Engine entry point
//!
//! [`Engine`] owns everything one batch needs and runs it through an
//! explicit lifecycle:
//!
//! 1. **construct**: [`EngineBuilder::build`] validates the configuration,
//!    takes the logs directory lock, loads snapshots and replays the append
//!    logs, and wires the components into a [`PipelineContext`]
//! 2. **run**: [`Engine::run`] walks the source tree once, bracketed by
//!    `started` and `success` run entries; [`Engine::run_until_signal`] does
//!    the same while watching for termination signals and panics
//! 3. **close**: [`Engine::close`] compacts the logs and releases the lock
//!
//! ## Example
//!
//! ```rust,no_run
//! use assetwalk::{EngineBuilder, EngineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::new("crop", "./uploads", "./outputs", "./logs");
//! let engine = EngineBuilder::new(config)
//!     .on_progress(|info| println!("{} settled", info.settled()))
//!     .build()?;
//!
//! let outcome = engine.run_until_signal().await;
//! let code = outcome.exit_code();
//! engine.close()?;
//! std::process::exit(code);
//! # }
//! ```

use crate::archive::{ArchiveCodec, ArchiveStage, ZipCodec};
use crate::classifier::PathClassifier;
use crate::config::EngineConfig;
use crate::error::{Result, WalkError};
use crate::journal::LogLock;
use crate::processor::{processor_for, ItemProcessor};
use crate::progress::ProgressStore;
use crate::resume::ResumeGate;
use crate::scheduler::ConcurrencyScheduler;
use crate::types::{
    ErrorContext, ProgressCallback, ProgressInfo, RunEntry, RunStatus, WalkSummary,
};
use crate::utils::{host_name, panic_message};
use crate::walker::TreeWalker;
use chrono::Utc;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Everything a traversal needs, built once per engine
pub struct PipelineContext {
    /// Validated configuration
    pub config: EngineConfig,
    /// Canonical source root
    pub source_root: PathBuf,
    /// Output root of this run (timestamped if configured)
    pub output_root: PathBuf,
    /// Entry classifier
    pub classifier: PathClassifier,
    /// Progress state
    pub store: Arc<ProgressStore>,
    /// Skip-or-process decisions
    pub gate: ResumeGate,
    /// Leaf fan-out
    pub scheduler: ConcurrencyScheduler,
    /// Per-item transform
    pub processor: Arc<dyn ItemProcessor>,
    /// Archive splicing
    pub archives: ArchiveStage,
    /// Progress callback
    pub on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("agent", &self.config.agent)
            .field("source_root", &self.source_root)
            .field("output_root", &self.output_root)
            .field("processor", &self.processor.name())
            .field("chunk_size", &self.scheduler.chunk_size())
            .finish()
    }
}

/// A termination signal the engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptSignal {
    /// Signal name, e.g. `SIGTERM`
    pub name: &'static str,
    /// Signal number
    pub number: i32,
}

impl InterruptSignal {
    /// `SIGINT` (Ctrl-C)
    pub const INTERRUPT: Self = Self { name: "SIGINT", number: 2 };
    /// `SIGTERM`
    pub const TERMINATE: Self = Self { name: "SIGTERM", number: 15 };
    /// `SIGQUIT`
    pub const QUIT: Self = Self { name: "SIGQUIT", number: 3 };
    /// `SIGHUP`
    pub const HANGUP: Self = Self { name: "SIGHUP", number: 1 };

    /// Conventional exit code: 128 + signal number
    pub fn exit_code(&self) -> i32 {
        128 + self.number
    }
}

/// How a guarded run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// The traversal finished
    Completed(WalkSummary),
    /// A termination signal stopped the run
    Interrupted(InterruptSignal),
    /// A fatal error or panic escaped the traversal
    Faulted(WalkError),
}

impl RunOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(_) => 0,
            RunOutcome::Interrupted(signal) => signal.exit_code(),
            RunOutcome::Faulted(e) => e.exit_code(),
        }
    }

    /// Summary of a completed run
    pub fn summary(&self) -> Option<&WalkSummary> {
        match self {
            RunOutcome::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

/// Resumable batch engine
pub struct Engine {
    pipeline: PipelineContext,
    lock: Option<LogLock>,
    run_id: Uuid,
    host: String,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("run_id", &self.run_id)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl Engine {
    /// Pipeline components of this engine
    pub fn pipeline(&self) -> &PipelineContext {
        &self.pipeline
    }

    /// Progress store of this engine
    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.pipeline.store
    }

    /// Output root of this run
    pub fn output_root(&self) -> &Path {
        &self.pipeline.output_root
    }

    /// Identifier shared by this run's history entries
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn run_entry(&self, status: RunStatus, error: Option<String>, summary: Option<WalkSummary>) -> RunEntry {
        RunEntry {
            timestamp: Utc::now(),
            agent: self.pipeline.config.agent.clone(),
            run_id: self.run_id,
            host: self.host.clone(),
            action: self.pipeline.config.action.clone(),
            status,
            error,
            summary,
        }
    }

    /// Walk the source tree once
    ///
    /// Item and archive failures are recorded and counted in the summary.
    ///
    /// # Errors
    ///
    /// Returns an error only if progress can no longer be recorded (durable
    /// log failures) or the source root cannot be listed.
    #[instrument(skip(self), fields(agent = %self.pipeline.config.agent, run_id = %self.run_id))]
    pub async fn run(&self) -> Result<WalkSummary> {
        let store = &self.pipeline.store;
        store.add_run_entry(self.run_entry(RunStatus::Started, None, None))?;

        let summary = TreeWalker::new(&self.pipeline).run().await?;

        store.add_run_entry(self.run_entry(RunStatus::Success, None, Some(summary.clone())))?;
        info!(
            "Run {} finished: {} processed, {} skipped, {} failed, {} archives",
            self.run_id, summary.processed, summary.skipped, summary.failed, summary.archives_spliced
        );
        Ok(summary)
    }

    /// Run until the traversal ends or a termination signal arrives
    ///
    /// Handles SIGINT, SIGTERM, SIGQUIT and SIGHUP (Ctrl-C only off unix).
    pub async fn run_until_signal(&self) -> RunOutcome {
        self.run_until(shutdown_signal()).await
    }

    /// Run until the traversal ends or `shutdown` resolves
    ///
    /// A signal records a `system_interruption` error and an `interrupted`
    /// run entry; a panic or fatal error records an `uncaught_exception`
    /// error and a `failed` run entry. Both paths compact the logs before
    /// returning. In-flight items are abandoned and stay `running`.
    #[instrument(skip(self, shutdown), fields(run_id = %self.run_id))]
    pub async fn run_until<S>(&self, shutdown: S) -> RunOutcome
    where
        S: Future<Output = InterruptSignal>,
    {
        let work = AssertUnwindSafe(self.run()).catch_unwind();

        let outcome = tokio::select! {
            result = work => match result {
                Ok(Ok(summary)) => RunOutcome::Completed(summary),
                Ok(Err(e)) => RunOutcome::Faulted(e),
                Err(panic) => RunOutcome::Faulted(WalkError::UnhandledFault(panic_message(panic.as_ref()))),
            },
            signal = shutdown => RunOutcome::Interrupted(signal),
        };

        match &outcome {
            RunOutcome::Completed(_) => {}
            RunOutcome::Interrupted(signal) => {
                warn!("Received {}, flushing progress", signal.name);
                self.record_abort(
                    format!("Process interrupted by {}", signal.name),
                    ErrorContext {
                        signal: Some(signal.name.to_string()),
                        ..ErrorContext::new("system_interruption", None)
                    },
                    RunStatus::Interrupted,
                );
            }
            RunOutcome::Faulted(e) => {
                error!("Run faulted: {}", e);
                self.record_abort(
                    e.to_string(),
                    ErrorContext::new("uncaught_exception", None),
                    RunStatus::Failed,
                );
            }
        }
        outcome
    }

    /// Best-effort record of an aborted run followed by a forced compaction
    fn record_abort(&self, message: String, context: ErrorContext, status: RunStatus) {
        let store = &self.pipeline.store;
        if let Err(e) = store.log_error(message.clone(), None, context) {
            warn!("Could not record interruption: {}", e);
        }
        if let Err(e) = store.add_run_entry(self.run_entry(status, Some(message), None)) {
            warn!("Could not record run entry: {}", e);
        }
        if let Err(e) = store.compact() {
            warn!("Could not compact progress logs: {}", e);
        }
    }

    /// Compact the logs and release the lock
    pub fn close(mut self) -> Result<()> {
        self.pipeline.store.close()?;
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        debug!("Engine closed");
        Ok(())
    }
}

/// Builder for [`Engine`]
///
/// # Default Values
///
/// - processor: selected by `config.processor`
/// - codec: [`ZipCodec`]
/// - progress callback: none
/// - force unlock: false
pub struct EngineBuilder {
    config: EngineConfig,
    processor: Option<Arc<dyn ItemProcessor>>,
    codec: Option<Arc<dyn ArchiveCodec>>,
    on_progress: Option<ProgressCallback>,
    force_unlock: bool,
}

impl EngineBuilder {
    /// Create a builder for a configuration
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            processor: None,
            codec: None,
            on_progress: None,
            force_unlock: false,
        }
    }

    /// Use a custom per-item transform
    pub fn processor(mut self, processor: Arc<dyn ItemProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Use a custom archive codec
    pub fn codec(mut self, codec: Arc<dyn ArchiveCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Receive a [`ProgressInfo`] after every leaf outcome
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressInfo) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Remove a stale `LOCK` file before acquiring the lock
    pub fn force_unlock(mut self, force: bool) -> Self {
        self.force_unlock = force;
        self
    }

    /// Validate, lock, load and wire the engine
    ///
    /// # Errors
    ///
    /// - [`WalkError::Config`] / [`WalkError::Pattern`] for a rejected configuration
    /// - [`WalkError::LogDirLocked`] if another writer holds the logs directory
    /// - [`WalkError::Journal`] if a snapshot cannot be read
    #[instrument(skip(self), fields(agent = %self.config.agent))]
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let source_root = config.source_dir.canonicalize()?;
        let output_root = config.run_output_dir(Utc::now());
        std::fs::create_dir_all(&output_root)?;

        let lock = if config.single_writer_lock {
            Some(LogLock::acquire(&config.logs_dir, self.force_unlock)?)
        } else {
            None
        };

        let store = Arc::new(ProgressStore::open(&config)?);
        let classifier = PathClassifier::new(&config)?;
        let processor = match self.processor {
            Some(p) => p,
            None => processor_for(&config)?,
        };
        let codec = self.codec.unwrap_or_else(|| Arc::new(ZipCodec));
        let archives = ArchiveStage::new(
            codec,
            store.clone(),
            source_root.clone(),
            output_root.clone(),
            config.recompress_archives,
        );

        let pipeline = PipelineContext {
            scheduler: ConcurrencyScheduler::new(config.chunk_size()),
            gate: ResumeGate::new(store.clone()),
            classifier,
            store,
            processor,
            archives,
            on_progress: self.on_progress,
            source_root,
            output_root,
            config,
        };

        let engine = Engine {
            pipeline,
            lock,
            run_id: Uuid::new_v4(),
            host: host_name(),
        };
        info!("Engine ready: {:?}", engine.pipeline);
        Ok(engine)
    }
}

/// Transform one file outside of any batch
///
/// Without `output`, the file is written into the configured output
/// directory (timestamped if configured) under its own name. No progress
/// is recorded.
pub async fn process_single(
    config: &EngineConfig,
    processor: &dyn ItemProcessor,
    input: &Path,
    output: Option<&Path>,
) -> Result<PathBuf> {
    if !input.is_file() {
        return Err(WalkError::config(format!("input {:?} is not a file", input)));
    }

    let destination = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let name = input
                .file_name()
                .ok_or_else(|| WalkError::config(format!("input {:?} has no file name", input)))?;
            config.run_output_dir(Utc::now()).join(name)
        }
    };
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let written = processor.process(input, &destination).await?;
    info!("Processed {:?} -> {:?}", input, written);
    Ok(written)
}

/// Fold the append logs of `config.logs_dir` into snapshots
pub fn compact_logs(config: &EngineConfig, force_unlock: bool) -> Result<()> {
    let lock = if config.single_writer_lock {
        Some(LogLock::acquire(&config.logs_dir, force_unlock)?)
    } else {
        None
    };
    let store = ProgressStore::open(config)?;
    store.compact()?;
    if let Some(lock) = lock {
        lock.release()?;
    }
    info!("Compacted progress logs in {:?}", config.logs_dir);
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> InterruptSignal {
    use futures::future::{select_all, LocalBoxFuture};
    use tokio::signal::unix::{signal, SignalKind};

    let mut streams = Vec::new();
    for (kind, sig) in [
        (SignalKind::interrupt(), InterruptSignal::INTERRUPT),
        (SignalKind::terminate(), InterruptSignal::TERMINATE),
        (SignalKind::quit(), InterruptSignal::QUIT),
        (SignalKind::hangup(), InterruptSignal::HANGUP),
    ] {
        match signal(kind) {
            Ok(stream) => streams.push((stream, sig)),
            Err(e) => warn!("Failed to install {} handler: {}", sig.name, e),
        }
    }

    if streams.is_empty() {
        return std::future::pending().await;
    }

    let waits: Vec<LocalBoxFuture<'_, InterruptSignal>> = streams
        .iter_mut()
        .map(|(stream, sig)| {
            let sig = *sig;
            async move {
                stream.recv().await;
                sig
            }
            .boxed_local()
        })
        .collect();

    let (signal, _, _) = select_all(waits).await;
    signal
}

#[cfg(not(unix))]
async fn shutdown_signal() -> InterruptSignal {
    match tokio::signal::ctrl_c().await {
        Ok(()) => InterruptSignal::INTERRUPT,
        Err(e) => {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending().await
        }
    }
}

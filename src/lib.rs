//! # assetwalk - Resumable batch traversal for image-asset trees
//!
//! A batch engine that walks very large image-asset trees, applies a
//! per-image transform, and records what has been done so the whole batch
//! can be killed at any point and resumed without redoing finished work.
//!
//! ## Overview
//!
//! assetwalk provides:
//! - A recursive walker that understands a Platform → App → Variant
//!   hierarchy and skips completed subtrees wholesale
//! - Transparent archive splicing: archives are extracted, walked in place,
//!   optionally rebuilt from the processed output, and cleaned up
//! - Bounded chunked concurrency for the leaf items of each directory
//! - A crash-safe progress log (append-only JSON lines with checksums)
//!   compacted into snapshots by mutation count or wall-clock interval
//! - Signal and panic handling that flushes progress before exiting
//!
//! ## Architecture
//!
//! - **PathClassifier** ([`classifier`]): labels entries as directory,
//!   archive, leaf or ignored and maps depth to hierarchy level
//! - **ArchiveStage** ([`archive`]): extract, recurse, recompress, clean up
//! - **ConcurrencyScheduler** ([`scheduler`]): chunked leaf fan-out
//! - **ProgressStore** ([`progress`]): App/Variant/Image state plus run
//!   and error history
//! - **DurableLog** ([`journal`]): append streams, snapshots, `LOCK`
//! - **ResumeGate** ([`resume`]): skip-or-process decisions
//! - **TreeWalker** ([`walker`]): the recursive driver
//! - **Engine** ([`engine`]): builder, lifecycle and signal handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use assetwalk::{EngineBuilder, EngineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = EngineConfig::new("crop", "./uploads", "./outputs", "./logs");
//! config.recompress_archives = true;
//!
//! let engine = EngineBuilder::new(config).build()?;
//! let summary = engine.run().await?;
//! println!("{} processed, {} skipped", summary.processed, summary.skipped);
//! engine.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Resume Semantics
//!
//! Only a `completed` record proves that work is done. Items left `running`
//! by a crash are processed again on the next run, so processing is
//! at-least-once and transforms should be idempotent.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, WalkError>`. Failures of a single item
//! or archive are recorded in the error history and never abort the batch;
//! failures of the progress log itself do.

// Public API modules
pub mod archive;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod processor;
pub mod progress;
pub mod resume;
pub mod scheduler;
pub mod status;
pub mod types;
pub mod walker;

// Internal modules
mod utils;

// Re-export main types for convenience
pub use archive::{ArchiveCodec, ArchiveStage, ZipCodec};
pub use classifier::PathClassifier;
pub use config::{CompactionPolicy, CompletionPolicy, EngineConfig, ProcessorKind};
pub use engine::{
    compact_logs, process_single, Engine, EngineBuilder, InterruptSignal, PipelineContext,
    RunOutcome,
};
pub use error::{ArchiveError, ArchiveErrorKind, ProcessingError, Result, WalkError};
pub use processor::{processor_for, CopyProcessor, ItemProcessor};
pub use progress::{ProgressStore, StatusCounts};
pub use resume::{Decision, ResumeGate};
pub use scheduler::ConcurrencyScheduler;
pub use status::StatusReport;
pub use types::*;
pub use walker::TreeWalker;

#[cfg(feature = "crop")]
pub use processor::{CropProcessor, CropProfile};

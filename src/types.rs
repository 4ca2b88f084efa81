//! Core data types used throughout assetwalk
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Traversal**: `DirectoryEntry`, `EntryKind`, `HierarchyLevel`, `TraversalContext`
//! - **Progress state**: `Scope`, `ProgressStatus`, `ProgressRecord`, `ProgressKey`
//! - **History**: `RunEntry`, `ErrorEntry`, `ErrorContext`
//! - **Reporting**: `WalkSummary`, `ProgressInfo`
//!
//! ## Examples
//!
//! ```rust
//! use assetwalk::types::{HierarchyLevel, ProgressKey, TraversalContext};
//! use std::path::Path;
//!
//! let ctx = TraversalContext::default()
//!     .descend(HierarchyLevel::App, "Calculator")
//!     .descend(HierarchyLevel::Variant, "ios 17");
//!
//! assert_eq!(ctx.variant.as_deref(), Some("ios 17"));
//!
//! let key = ProgressKey::image("crop", Path::new("/data/Calculator/ios 17/a.png"));
//! assert_eq!(key.as_str(), "crop:/data/Calculator/ios 17/a.png");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Classification of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A subdirectory to descend into
    Directory,
    /// An archive to splice into the walk
    Archive,
    /// A file eligible for the per-item transform
    Leaf,
    /// Hidden, reserved, filtered or unsupported entry
    Ignored,
}

/// A classified directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Full path of the entry
    pub path: PathBuf,
    /// File name as UTF-8 (lossy)
    pub name: String,
    /// Classification
    pub kind: EntryKind,
}

/// Meaning of a directory within the asset hierarchy
///
/// Hierarchy meaning is decoupled from raw recursion depth: the
/// [`PathClassifier`](crate::classifier::PathClassifier) maps an entry depth
/// to a level through the configured schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchyLevel {
    /// The source root itself
    Root,
    /// Platform grouping (e.g. ios, android)
    Platform,
    /// One product's assets
    App,
    /// A capture/version grouping under an App
    Variant,
    /// Any directory below the schema (plain container)
    Leaf,
}

impl fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HierarchyLevel::Root => "root",
            HierarchyLevel::Platform => "platform",
            HierarchyLevel::App => "app",
            HierarchyLevel::Variant => "variant",
            HierarchyLevel::Leaf => "leaf",
        };
        f.write_str(s)
    }
}

/// Hierarchy position propagated down the recursion
///
/// Each recursive call receives its own copy; sibling branches never share
/// a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraversalContext {
    /// Platform name, if the schema has a platform level
    pub platform: Option<String>,
    /// App name
    pub app: Option<String>,
    /// Variant name (explicit folder or synthesized default)
    pub variant: Option<String>,
}

impl TraversalContext {
    /// Context for a child directory at the given level
    pub fn descend(&self, level: HierarchyLevel, name: &str) -> Self {
        let mut next = self.clone();
        match level {
            HierarchyLevel::Platform => next.platform = Some(name.to_string()),
            HierarchyLevel::App => {
                next.app = Some(name.to_string());
                next.variant = None;
            }
            HierarchyLevel::Variant => next.variant = Some(name.to_string()),
            HierarchyLevel::Root | HierarchyLevel::Leaf => {}
        }
        next
    }

    /// Same context with the variant set
    pub fn with_variant(&self, variant: &str) -> Self {
        let mut next = self.clone();
        next.variant = Some(variant.to_string());
        next
    }
}

/// Granularity of a progress record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// App folder
    App,
    /// Variant folder
    Variant,
    /// Single leaf item
    Image,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::App => "app",
            Scope::Variant => "variant",
            Scope::Image => "image",
        };
        f.write_str(s)
    }
}

/// Persisted status of a key; a key without a record is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    /// Work started and has not finished (or the process died)
    Running,
    /// Work finished; terminal unless force-reprocess is configured
    Completed,
    /// Work failed; eligible for the next run
    Failed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgressStatus::Running => "running",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress record for one App, Variant or Image key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Agent owning the key
    pub agent: String,
    /// Current status
    pub status: ProgressStatus,
    /// When the current attempt started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the key completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Last error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of attempts started for this key
    #[serde(default)]
    pub attempts: u32,
}

impl ProgressRecord {
    /// Whether the record proves the key is done
    pub fn is_completed(&self) -> bool {
        self.status == ProgressStatus::Completed
    }
}

/// Fully qualified progress key
///
/// Keys are formatted as `<agent>:<app>[/<variant>][/<imageAbsolutePath>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    scope: Scope,
    key: String,
}

impl ProgressKey {
    /// Key for an App
    pub fn app(agent: &str, app: &str) -> Self {
        Self {
            scope: Scope::App,
            key: format!("{}:{}", agent, app),
        }
    }

    /// Key for a Variant of an App
    pub fn variant(agent: &str, app: &str, variant: &str) -> Self {
        Self {
            scope: Scope::Variant,
            key: format!("{}:{}/{}", agent, app, variant),
        }
    }

    /// Key for an Image, derived from its canonical absolute source path
    ///
    /// The key does not depend on the App or Variant the walk reached the
    /// image through, so an item keeps its key when a resumed run reaches it
    /// along a different route.
    pub fn image(agent: &str, path: &Path) -> Self {
        Self {
            scope: Scope::Image,
            key: format!("{}:{}", agent, path.to_string_lossy()),
        }
    }

    /// Scope of this key
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Key string as persisted
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.scope, self.key)
    }
}

/// Status of a pipeline invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Invocation began
    Started,
    /// Invocation finished its traversal
    Success,
    /// Invocation ended with a fault
    Failed,
    /// Invocation was stopped by a signal
    Interrupted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Immutable record of one pipeline invocation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,
    /// Agent that ran
    pub agent: String,
    /// Identifier shared by all entries of one invocation
    pub run_id: Uuid,
    /// Host the invocation ran on
    pub host: String,
    /// Action name (e.g. `batch`)
    pub action: String,
    /// Status
    pub status: RunStatus,
    /// Error message for failed or interrupted runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Counters for finished runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<WalkSummary>,
}

/// Structured context attached to an error entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Action that failed (`unzip`, `process`, `system_interruption`, ...)
    pub action: String,
    /// Path involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// App in scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    /// Variant in scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Signal name for interruptions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl ErrorContext {
    /// Context for an action on a path
    pub fn new(action: impl Into<String>, path: Option<&Path>) -> Self {
        Self {
            action: action.into(),
            path: path.map(Path::to_path_buf),
            ..Default::default()
        }
    }

    /// Attach the traversal position
    pub fn within(mut self, ctx: &TraversalContext) -> Self {
        self.app = ctx.app.clone();
        self.variant = ctx.variant.clone();
        self
    }
}

/// Durable error record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// When the error was recorded
    pub timestamp: DateTime<Utc>,
    /// Agent that recorded it
    pub agent: String,
    /// Error message
    pub message: String,
    /// Stack-like detail (error source chain)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Structured context
    pub context: ErrorContext,
}

/// Counters produced by a traversal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkSummary {
    /// Leaf items transformed successfully
    pub processed: usize,
    /// Leaf items skipped because they were already completed
    pub skipped: usize,
    /// Leaf items whose transform failed
    pub failed: usize,
    /// Apps marked completed
    pub apps_completed: usize,
    /// Apps skipped because they were already completed
    pub apps_skipped: usize,
    /// Variants marked completed
    pub variants_completed: usize,
    /// Variants skipped because they were already completed
    pub variants_skipped: usize,
    /// Archives extracted and walked
    pub archives_spliced: usize,
    /// Archives skipped because their sibling directory existed
    pub archives_skipped: usize,
    /// Archives that failed validation, extraction or recompression
    pub archives_failed: usize,
}

impl WalkSummary {
    /// Fold another summary into this one
    pub fn merge(&mut self, other: &WalkSummary) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.apps_completed += other.apps_completed;
        self.apps_skipped += other.apps_skipped;
        self.variants_completed += other.variants_completed;
        self.variants_skipped += other.variants_skipped;
        self.archives_spliced += other.archives_spliced;
        self.archives_skipped += other.archives_skipped;
        self.archives_failed += other.archives_failed;
    }

    /// Whether anything below this subtree failed
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.archives_failed > 0
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far in this run
    pub processed: usize,
    /// Items skipped so far in this run
    pub skipped: usize,
    /// Items failed so far in this run
    pub failed: usize,
}

impl ProgressInfo {
    /// Total items settled so far
    pub fn settled(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

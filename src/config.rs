//! Engine configuration
//!
//! One validated configuration structure is resolved once at startup and
//! then shared read-only by every component. Precedence, lowest first:
//!
//! 1. built-in defaults ([`EngineConfig::default`])
//! 2. values from a JSON config file ([`EngineConfig::from_file`]); relative
//!    paths are resolved against the file's directory
//! 3. command-line overrides applied by the binary
//!
//! [`EngineConfig::validate`] runs after all layers are merged. A rejected
//! configuration is a fatal pre-flight error.
//!
//! ## Example
//!
//! ```json
//! {
//!   "agent": "Agent1Crop",
//!   "source_dir": "uploads",
//!   "output_dir": "outputs",
//!   "logs_dir": "logs",
//!   "hierarchy": ["platform", "app", "variant"],
//!   "recompress_archives": true,
//!   "compaction": { "max_mutations": 500, "interval": "30s" }
//! }
//! ```

use crate::error::{Result, WalkError};
use crate::types::HierarchyLevel;
use chrono::{DateTime, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whether failed leaves block the completion of their App/Variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Mark completed once the subtree has been visited, failures or not
    #[default]
    Always,
    /// Mark failed (and retry next run) when anything below failed
    RequireSuccess,
}

/// When the durable log is folded into snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionPolicy {
    /// Mutations since the last compaction that trigger a new one
    pub max_mutations: usize,
    /// Wall-clock time since the last compaction that triggers a new one
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            max_mutations: 500,
            interval: Duration::from_secs(30),
        }
    }
}

/// Built-in per-item transforms available to the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    /// Copy the item into the output mirror
    #[default]
    Copy,
    /// Bottom-crop the image by aspect-ratio profile
    Crop,
}

/// Settings for the bottom-crop processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropSettings {
    /// Output format extension (`png`, `jpg`, `webp`)
    pub output_format: String,
    /// height / width above which an image is treated as a mobile screenshot
    pub mobile_aspect_ratio_threshold: f32,
    /// Fraction of the height removed from the bottom of mobile screenshots
    pub mobile_bottom_crop_percent: f32,
    /// Fraction of the height removed from the bottom of desktop screenshots
    pub desktop_bottom_crop_percent: f32,
}

impl Default for CropSettings {
    fn default() -> Self {
        Self {
            output_format: "png".to_string(),
            mobile_aspect_ratio_threshold: 1.5,
            mobile_bottom_crop_percent: 0.08,
            desktop_bottom_crop_percent: 0.05,
        }
    }
}

impl CropSettings {
    /// Check that the crop fractions and threshold are usable
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("mobile_bottom_crop_percent", self.mobile_bottom_crop_percent),
            ("desktop_bottom_crop_percent", self.desktop_bottom_crop_percent),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(WalkError::config(format!(
                    "crop.{} must be a fraction in [0, 1), got {}",
                    label, value
                )));
            }
        }
        if !(self.mobile_aspect_ratio_threshold.is_finite() && self.mobile_aspect_ratio_threshold > 0.0) {
            return Err(WalkError::config("crop.mobile_aspect_ratio_threshold must be positive"));
        }
        Ok(())
    }
}

/// Configuration for an engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Agent identifier; prefixes every progress key
    pub agent: String,
    /// Root of the source asset tree
    pub source_dir: PathBuf,
    /// Root of the output mirror
    pub output_dir: PathBuf,
    /// Root of the progress logs
    pub logs_dir: PathBuf,
    /// Hierarchy level of entries at depth 0, 1, 2, ...
    pub hierarchy: Vec<HierarchyLevel>,
    /// Variant synthesized for leaves sitting directly under an App
    pub default_variant: Option<String>,
    /// Allow-listed leaf extensions (without dot, case-insensitive)
    pub valid_extensions: Vec<String>,
    /// Archive extension (without dot)
    pub archive_extension: String,
    /// Name prefixes skipped unconditionally
    pub reserved_prefixes: Vec<String>,
    /// Exact names skipped unconditionally
    pub reserved_names: Vec<String>,
    /// Extra glob patterns (matched against the entry name) to skip
    pub ignore_patterns: Vec<String>,
    /// Rebuild archives from their processed output
    pub recompress_archives: bool,
    /// Whether failed leaves block App/Variant completion
    pub completion_policy: CompletionPolicy,
    /// Reprocess keys that are already completed
    pub force_reprocess: bool,
    /// Leaf chunk size; defaults to host parallelism minus one
    pub concurrency: Option<usize>,
    /// Compaction triggers
    pub compaction: CompactionPolicy,
    /// fsync every appended record
    pub sync_writes: bool,
    /// Guard the logs directory with a LOCK file
    pub single_writer_lock: bool,
    /// Action name recorded in error and run entries
    pub action: String,
    /// Write each run into a timestamped subdirectory of `output_dir`
    pub timestamped_output: bool,
    /// Per-item transform used by the binary
    pub processor: ProcessorKind,
    /// Crop processor settings
    pub crop: CropSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent: "assetwalk".to_string(),
            source_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            logs_dir: PathBuf::from("logs"),
            hierarchy: vec![
                HierarchyLevel::Platform,
                HierarchyLevel::App,
                HierarchyLevel::Variant,
            ],
            default_variant: Some("default".to_string()),
            valid_extensions: ["png", "jpg", "jpeg", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            archive_extension: "zip".to_string(),
            reserved_prefixes: vec![".".to_string(), "._".to_string()],
            reserved_names: vec![
                "__MACOSX".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
            ],
            ignore_patterns: Vec::new(),
            recompress_archives: true,
            completion_policy: CompletionPolicy::Always,
            force_reprocess: false,
            concurrency: None,
            compaction: CompactionPolicy::default(),
            sync_writes: false,
            single_writer_lock: true,
            action: "process".to_string(),
            timestamped_output: false,
            processor: ProcessorKind::Copy,
            crop: CropSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for the given directories with defaults elsewhere
    pub fn new(
        agent: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent: agent.into(),
            source_dir: source_dir.into(),
            output_dir: output_dir.into(),
            logs_dir: logs_dir.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file
    ///
    /// Fields missing from the file keep their defaults. Relative paths are
    /// resolved against the directory containing the file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            WalkError::config(format!("cannot read config file {:?}: {}", path, e))
        })?;
        let mut config: EngineConfig = serde_json::from_str(&text).map_err(|e| {
            WalkError::config(format!("cannot parse config file {:?}: {}", path, e))
        })?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_relative(&base);
        Ok(config)
    }

    /// Resolve relative directories against `base`
    pub fn resolve_relative(&mut self, base: &Path) {
        for dir in [&mut self.source_dir, &mut self.output_dir, &mut self.logs_dir] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Check the merged configuration
    pub fn validate(&self) -> Result<()> {
        if self.agent.trim().is_empty() {
            return Err(WalkError::config("agent must not be empty"));
        }
        if self.agent.contains(':') {
            return Err(WalkError::config("agent must not contain ':'"));
        }

        if !self.source_dir.is_dir() {
            return Err(WalkError::config(format!(
                "source directory {:?} does not exist",
                self.source_dir
            )));
        }
        let source = fs::canonicalize(&self.source_dir)?;
        for (label, dir) in [("output", &self.output_dir), ("logs", &self.logs_dir)] {
            if absolutize(dir)?.starts_with(&source) {
                return Err(WalkError::config(format!(
                    "{} directory {:?} must not live inside the source tree",
                    label, dir
                )));
            }
        }

        if self.valid_extensions.is_empty() {
            return Err(WalkError::config("valid_extensions must not be empty"));
        }
        if self.archive_extension.is_empty() {
            return Err(WalkError::config("archive_extension must not be empty"));
        }
        if self.compaction.max_mutations == 0 {
            return Err(WalkError::config("compaction.max_mutations must be at least 1"));
        }
        if self.compaction.interval.is_zero() {
            return Err(WalkError::config("compaction.interval must be positive"));
        }
        if self.concurrency == Some(0) {
            return Err(WalkError::config("concurrency must be at least 1"));
        }
        if let Some(variant) = &self.default_variant {
            if variant.is_empty() || variant.contains('/') {
                return Err(WalkError::config("default_variant must be a plain folder name"));
            }
        }

        self.validate_hierarchy()?;
        self.crop.validate()?;

        for pattern in &self.ignore_patterns {
            Glob::new(pattern).map_err(|e| WalkError::Pattern(format!("{}: {}", pattern, e)))?;
        }

        Ok(())
    }

    fn validate_hierarchy(&self) -> Result<()> {
        let position = |level| self.hierarchy.iter().position(|l| *l == level);

        for (i, level) in self.hierarchy.iter().enumerate() {
            if matches!(level, HierarchyLevel::Root | HierarchyLevel::Leaf) {
                return Err(WalkError::config(format!(
                    "hierarchy level '{}' is implicit and cannot be configured",
                    level
                )));
            }
            if self.hierarchy[..i].contains(level) {
                return Err(WalkError::config(format!("hierarchy level '{}' repeated", level)));
            }
        }

        let app = position(HierarchyLevel::App)
            .ok_or_else(|| WalkError::config("hierarchy must contain an 'app' level"))?;
        if let Some(platform) = position(HierarchyLevel::Platform) {
            if platform > app {
                return Err(WalkError::config("'platform' must come before 'app'"));
            }
        }
        if let Some(variant) = position(HierarchyLevel::Variant) {
            if variant < app {
                return Err(WalkError::config("'variant' must come after 'app'"));
            }
        }
        Ok(())
    }

    /// Number of leaf items dispatched concurrently
    pub fn chunk_size(&self) -> usize {
        self.concurrency
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .max(1)
    }

    /// Output directory for a run started at `now`
    pub fn run_output_dir(&self, now: DateTime<Utc>) -> PathBuf {
        if self.timestamped_output {
            self.output_dir
                .join(now.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string())
        } else {
            self.output_dir.clone()
        }
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(fs::canonicalize(path)?);
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Serde adapter writing durations as humantime strings (`"30s"`, `"5m"`)
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

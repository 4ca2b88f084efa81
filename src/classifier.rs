//! Entry classification for the tree walk
//!
//! [`PathClassifier`] decides what the walker does with each directory entry
//! and what a directory means within the asset hierarchy. Filtering happens
//! here, before anything is counted, logged or recursed into:
//!
//! - names starting with a reserved prefix (default `.` and `._`)
//! - exact reserved names (default `__MACOSX`, `.DS_Store`, `Thumbs.db`)
//! - names matching a configured glob pattern
//! - files whose extension is neither allow-listed nor the archive extension
//!
//! Entries that survive are sorted in natural order, so `img2.png` comes
//! before `img10.png` and `Beta` sorts next to `alpha`.

use crate::archive::SPLICE_MARKER;
use crate::config::EngineConfig;
use crate::error::{Result, WalkError};
use crate::types::{DirectoryEntry, EntryKind, HierarchyLevel};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;

/// Classifies directory entries and maps depths to hierarchy levels
#[derive(Debug, Clone)]
pub struct PathClassifier {
    reserved_prefixes: Vec<String>,
    reserved_names: HashSet<String>,
    ignore: GlobSet,
    extensions: HashSet<String>,
    archive_extension: String,
    hierarchy: Vec<HierarchyLevel>,
}

impl PathClassifier {
    /// Build a classifier from the engine configuration
    ///
    /// # Errors
    ///
    /// Returns [`WalkError::Pattern`] if an ignore pattern does not compile.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignore_patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| WalkError::Pattern(format!("{}: {}", pattern, e)))?;
            builder.add(glob);
        }
        let ignore = builder
            .build()
            .map_err(|e| WalkError::Pattern(e.to_string()))?;

        Ok(Self {
            reserved_prefixes: config.reserved_prefixes.clone(),
            reserved_names: config.reserved_names.iter().cloned().collect(),
            ignore,
            extensions: config
                .valid_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            archive_extension: config
                .archive_extension
                .trim_start_matches('.')
                .to_ascii_lowercase(),
            hierarchy: config.hierarchy.clone(),
        })
    }

    /// Whether a name is hidden, reserved or pattern-ignored
    pub fn is_reserved(&self, name: &str) -> bool {
        name == SPLICE_MARKER
            || self.reserved_names.contains(name)
            || self
                .reserved_prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
            || self.ignore.is_match(name)
    }

    /// Classify an entry by name and file type
    pub fn classify_name(&self, name: &str, is_dir: bool) -> EntryKind {
        if self.is_reserved(name) {
            return EntryKind::Ignored;
        }
        if is_dir {
            return EntryKind::Directory;
        }

        match extension_of(name) {
            Some(ext) if ext == self.archive_extension => EntryKind::Archive,
            Some(ext) if self.extensions.contains(&ext) => EntryKind::Leaf,
            _ => EntryKind::Ignored,
        }
    }

    /// Classify a path that is known to exist
    pub fn classify(&self, path: &Path, is_dir: bool) -> DirectoryEntry {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = self.classify_name(&name, is_dir);
        DirectoryEntry {
            path: path.to_path_buf(),
            name,
            kind,
        }
    }

    /// Whether a file name carries an allow-listed leaf extension
    pub fn is_leaf_name(&self, name: &str) -> bool {
        extension_of(name).is_some_and(|ext| self.extensions.contains(&ext))
    }

    /// Hierarchy level of an entry found at `depth`
    ///
    /// Depth 0 is an entry directly under the source root. Depths past the
    /// end of the schema are plain containers.
    pub fn level_for_depth(&self, depth: usize) -> HierarchyLevel {
        self.hierarchy
            .get(depth)
            .copied()
            .unwrap_or(HierarchyLevel::Leaf)
    }

    /// Directory name an archive extracts into (its base name)
    pub fn archive_stem<'a>(&self, name: &'a str) -> &'a str {
        let suffix_len = self.archive_extension.len() + 1;
        if name.len() > suffix_len && name.is_char_boundary(name.len() - suffix_len) {
            &name[..name.len() - suffix_len]
        } else {
            name
        }
    }

    /// Sort entries in natural order
    pub fn sort_entries(entries: &mut [DirectoryEntry]) {
        entries.sort_by(|a, b| natural_cmp(&a.name, &b.name));
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

#[derive(Debug, PartialEq, Eq)]
enum Chunk<'a> {
    Digits(&'a str),
    Text(&'a str),
}

fn chunks(s: &str) -> Vec<Chunk<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_digits = None;

    for (i, c) in s.char_indices() {
        let digit = c.is_ascii_digit();
        match in_digits {
            Some(prev) if prev != digit => {
                out.push(if prev {
                    Chunk::Digits(&s[start..i])
                } else {
                    Chunk::Text(&s[start..i])
                });
                start = i;
            }
            _ => {}
        }
        in_digits = Some(digit);
    }
    if let Some(digit) = in_digits {
        out.push(if digit {
            Chunk::Digits(&s[start..])
        } else {
            Chunk::Text(&s[start..])
        });
    }
    out
}

/// Case-insensitive, numeric-aware comparison
///
/// Digit runs compare by value, text runs compare case-insensitively.
/// Names equal under those rules fall back to a byte comparison so the
/// order stays total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (ca, cb) = (chunks(a), chunks(b));

    for (x, y) in ca.iter().zip(cb.iter()) {
        let ord = match (x, y) {
            (Chunk::Digits(x), Chunk::Digits(y)) => {
                let (x, y) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (Chunk::Text(x), Chunk::Text(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
            (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
            (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    ca.len().cmp(&cb.len()).then_with(|| a.cmp(b))
}

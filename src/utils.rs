//! Utility functions for assetwalk
//!
//! Small helpers shared by the journal, the walker and the archive stage:
//! hashing, atomic writes, path mapping between the source tree and the
//! output mirror, and panic payload formatting.

use crate::error::{Result, WalkError};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::trace;

/// Hash arbitrary data using SHA-256
///
/// Returns the hash as a 64-character hexadecimal string.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Atomic file write (write to temp file then rename)
///
/// The temporary file is created next to the target so the final rename
/// never crosses a filesystem. Contents are synced before the rename; a
/// reader sees either the old file or the complete new one.
///
/// # Errors
///
/// - [`WalkError::Io`] if the temporary file cannot be written or synced
/// - [`WalkError::Io`] if the rename fails
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| WalkError::Io(e.error))?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first and falls back to canonicalizing both
/// paths.
///
/// # Errors
///
/// - [`WalkError::Internal`] if the path is not under the base path
/// - [`WalkError::Io`] if canonicalization fails (fallback case only)
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            WalkError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Map a source path to its location in the output mirror
///
/// `output_root/<path relative to source_root>`
pub fn mirror_path(path: &Path, source_root: &Path, output_root: &Path) -> Result<PathBuf> {
    Ok(output_root.join(make_relative(path, source_root)?))
}

/// Whether a relative archive member path stays inside its destination
pub fn is_contained(relative: &Path) -> bool {
    !relative.as_os_str().is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Remove a directory tree if it exists
///
/// Returns whether anything was removed.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            trace!("Removed directory tree: {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Host name for run entries and lock files
pub fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Printable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

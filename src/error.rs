//! Error types for assetwalk
//!
//! This module defines every error the engine can surface. The taxonomy
//! follows the propagation policy of the traversal:
//!
//! - [`WalkError::Config`] is fatal and only raised before a batch starts
//! - [`ArchiveError`] and [`ProcessingError`] are absorbed at the archive or
//!   item boundary, recorded in the durable error stream, and the batch
//!   continues with the next sibling
//! - [`WalkError::SignalInterrupt`] and [`WalkError::UnhandledFault`] end the
//!   process after the progress state has been flushed
//! - failures of the durable log itself propagate, since progress can no
//!   longer be recorded safely

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in assetwalk
pub type Result<T> = std::result::Result<T, WalkError>;

/// Reason an archive could not be spliced into the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveErrorKind {
    /// Archive file has zero length
    Empty,
    /// Archive does not start with the container magic signature
    BadSignature,
    /// Codec failed while reading the archive
    DecodeFailure,
    /// Codec failed while building an archive
    EncodeFailure,
}

impl fmt::Display for ArchiveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchiveErrorKind::Empty => "EMPTY",
            ArchiveErrorKind::BadSignature => "BAD_SIGNATURE",
            ArchiveErrorKind::DecodeFailure => "DECODE_FAILURE",
            ArchiveErrorKind::EncodeFailure => "ENCODE_FAILURE",
        };
        f.write_str(s)
    }
}

/// Failure reported by an [`ArchiveCodec`](crate::archive::ArchiveCodec)
#[derive(Debug, Error)]
#[error("archive {kind} at {path:?}: {detail}")]
pub struct ArchiveError {
    /// Failure category
    pub kind: ArchiveErrorKind,
    /// Archive being read or written
    pub path: PathBuf,
    /// Human readable detail from the codec
    pub detail: String,
}

impl ArchiveError {
    /// Create a new archive error
    pub fn new(kind: ArchiveErrorKind, path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// Failure reported by an [`ItemProcessor`](crate::processor::ItemProcessor)
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The input format is not handled by the processor
    #[error("unsupported format: {0:?}")]
    Unsupported(PathBuf),

    /// The input could not be decoded
    #[error("malformed input {path:?}: {reason}")]
    Malformed {
        /// Input path
        path: PathBuf,
        /// Decoder message
        reason: String,
    },

    /// Anything that went wrong after decoding (I/O, encoder, subprocess)
    #[error("processing failed for {path:?}: {reason}")]
    Downstream {
        /// Input path
        path: PathBuf,
        /// Failure message
        reason: String,
    },
}

impl ProcessingError {
    /// Create a downstream error from anything printable
    pub fn downstream(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        ProcessingError::Downstream {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Main error type for all assetwalk operations
#[derive(Debug, Error)]
pub enum WalkError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Invalid or incomplete configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Archive could not be validated, extracted or rebuilt
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Per-item transform failed
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    /// Process received a termination signal
    #[error("Interrupted by signal {signal}")]
    SignalInterrupt {
        /// Signal name, e.g. `SIGINT`
        signal: String,
        /// Process exit code derived from the signal
        code: i32,
    },

    /// A fault escaped the traversal (panic or unexpected condition)
    #[error("Unhandled fault: {0}")]
    UnhandledFault(String),

    /// Another writer holds the logs directory
    #[error("Logs directory {path:?} is locked by {holder}")]
    LogDirLocked {
        /// Lock file path
        path: PathBuf,
        /// Contents of the lock file (pid, host, time)
        holder: String,
    },

    /// Durable log could not be read or written consistently
    #[error("Journal error: {0}")]
    Journal(String),

    /// Invalid ignore pattern
    #[error("Invalid ignore pattern: {0}")]
    Pattern(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalkError {
    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        WalkError::Config(msg.into())
    }

    /// Create a journal error with a custom message
    pub fn journal(msg: impl Into<String>) -> Self {
        WalkError::Journal(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        WalkError::Internal(msg.into())
    }

    /// Whether this error must end the process
    ///
    /// Archive and processing errors are absorbed by the traversal, every
    /// other variant reaching the entry point is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WalkError::Archive(_) | WalkError::Processing(_))
    }

    /// Short category label used in error entries
    pub fn category(&self) -> &'static str {
        match self {
            WalkError::Config(_) => "config",
            WalkError::Archive(_) => "archive",
            WalkError::Processing(_) => "processing",
            WalkError::SignalInterrupt { .. } => "signal",
            WalkError::UnhandledFault(_) => "fault",
            WalkError::LogDirLocked { .. } => "lock",
            WalkError::Journal(_) | WalkError::Json(_) => "journal",
            WalkError::Pattern(_) => "pattern",
            WalkError::Io(_) | WalkError::WalkDir(_) => "io",
            WalkError::Internal(_) => "internal",
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            WalkError::Config(_) | WalkError::Pattern(_) | WalkError::LogDirLocked { .. } => 2,
            WalkError::SignalInterrupt { code, .. } => *code,
            _ => 1,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            WalkError::LogDirLocked { path, holder } => {
                format!(
                    "Another run holds {:?} ({}). Wait for it to finish, or pass --force-unlock \
                     if that process is gone.",
                    path, holder
                )
            }
            WalkError::Config(msg) => {
                format!("Configuration rejected: {}. Check the config file and CLI flags.", msg)
            }
            _ => self.to_string(),
        }
    }
}

//! Error types for arcpipe
//!
//! This module provides the error taxonomy of the pipeline:
//! - Spawn failures (missing executable, unusable working directory)
//! - Stage failures (non-zero exit, byte-sink failure, cancellation), carrying
//!   the failing stage and the tool's error-stream text
//! - Header layout errors for composite (RPM) archives, raised before any stage runs
//! - Machine-readable error codes for the GUI layer
//!
//! Malformed listing lines are deliberately absent: the listing parser degrades
//! them into best-effort entries instead of failing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{ArchiveId, ExitStatus, Stage};

/// Result type alias for arcpipe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for arcpipe
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "chunk_size")
        key: Option<String>,
    },

    /// An external tool could not be started
    #[error("spawn failed: {0}")]
    Spawn(#[from] SpawnError),

    /// A pipeline stage failed
    #[error("{0}")]
    Stage(#[from] StageFailure),

    /// The composite archive header does not describe a usable payload
    #[error("header layout error: {0}")]
    HeaderLayout(#[from] HeaderLayoutError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No handle with this ID
    #[error("archive {0} not found")]
    NotFound(ArchiveId),

    /// The handle already has a live pipeline
    #[error("archive {0} already has a running pipeline")]
    Busy(ArchiveId),

    /// Operation not supported for this archive kind
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Machine-readable error code, stable across releases
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Spawn(e) => match e {
                SpawnError::EmptyCommand => "empty_command",
                SpawnError::NotFound { .. } => "executable_not_found",
                SpawnError::WorkingDirectory { .. } => "working_directory",
                SpawnError::Io { .. } => "spawn_failed",
            },
            Error::Stage(failure) => match failure.reason {
                FailureReason::SpawnFailure => "stage_spawn_failed",
                FailureReason::NonZeroExit => "non_zero_exit",
                FailureReason::SinkFailure => "sink_failed",
                FailureReason::Cancelled => "cancelled",
            },
            Error::HeaderLayout(e) => match e {
                HeaderLayoutError::BadMagic => "bad_magic",
                HeaderLayoutError::Truncated { .. } => "header_truncated",
                HeaderLayoutError::OffsetBeyondEnd { .. } => "offset_beyond_end",
                HeaderLayoutError::UnknownPayload { .. } => "unknown_payload",
            },
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::Busy(_) => "busy",
            Error::NotSupported(_) => "not_supported",
        }
    }
}

/// Failures while starting an external tool
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The command template had no program token
    #[error("empty command")]
    EmptyCommand,

    /// The executable could not be located
    #[error("executable {program} not found")]
    NotFound {
        /// Program that was looked up
        program: String,
    },

    /// The requested working directory cannot be entered
    #[error("working directory {} is not usable: {reason}", path.display())]
    WorkingDirectory {
        /// The directory that was requested
        path: PathBuf,
        /// Why it cannot be used
        reason: String,
    },

    /// Any other OS-level spawn failure
    #[error("failed to spawn {program}: {source}")]
    Io {
        /// Program that failed to start
        program: String,
        /// Underlying OS error
        source: std::io::Error,
    },
}

/// Why a stage ended the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The stage's process could not be started
    SpawnFailure,
    /// The process terminated without satisfying the completion predicate
    NonZeroExit,
    /// Writing the stage's output into its staging file failed
    SinkFailure,
    /// The pipeline was cancelled
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::SpawnFailure => "could not be spawned",
            FailureReason::NonZeroExit => "tool reported failure",
            FailureReason::SinkFailure => "output could not be written",
            FailureReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// A failed pipeline stage, as surfaced to the user
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{stage} stage failed: {reason}")]
pub struct StageFailure {
    /// The stage that failed
    pub stage: Stage,
    /// Failure classification
    pub reason: FailureReason,
    /// Exit status, when the process ran at all
    pub exit: Option<ExitStatus>,
    /// Error-stream text of the stage, or the spawn/sink error message
    pub diagnostic: String,
}

/// Errors while locating the payload of a composite archive
#[derive(Debug, Error)]
pub enum HeaderLayoutError {
    /// The file does not start with the RPM lead magic
    #[error("not an RPM package: bad lead magic")]
    BadMagic,

    /// The file ends inside a header region
    #[error("header truncated: needed {needed} bytes at offset {offset}")]
    Truncated {
        /// Offset of the read that came up short
        offset: u64,
        /// Bytes that were required
        needed: usize,
    },

    /// The computed offset does not fall inside the file
    #[error("payload offset {offset} lies beyond end of file ({len} bytes)")]
    OffsetBeyondEnd {
        /// Computed payload offset
        offset: u64,
        /// File length
        len: u64,
    },

    /// The bytes at the payload offset match no known compressor
    #[error("unrecognised payload compression at offset {offset}")]
    UnknownPayload {
        /// Computed payload offset
        offset: u64,
    },
}

/// Serializable error summary for the GUI layer
///
/// # Example JSON
///
/// ```json
/// { "code": "non_zero_exit", "message": "list stage failed: tool reported failure" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for ErrorDetail {
    fn from(error: &Error) -> Self {
        Self {
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }
}

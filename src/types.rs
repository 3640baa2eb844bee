//! Core types for arcpipe

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::StageFailure;

/// Unique identifier for an archive handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(pub u64);

impl ArchiveId {
    /// Create a new ArchiveId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ArchiveId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Archive format as far as the backend cares
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// tar archive, optionally compressed (GNU tar auto-detects compression)
    Tar,
    /// RPM package wrapping a compressed cpio payload
    Rpm,
    /// Anything this backend does not drive
    Other,
}

/// One file or directory record parsed from a tool listing
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Path inside the archive; directories end with `/`
    pub name: String,
    /// Permission string as printed by the tool (e.g. `drwxr-xr-x`)
    pub permissions: String,
    /// Owning user
    pub owner: String,
    /// Owning group
    pub group: String,
    /// Size in bytes (zero when the tool printed nothing usable)
    pub size: u64,
    /// Modification time exactly as the tool printed it
    pub modified: String,
    /// Symbolic link target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Hard link count (cpio listings only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_count: Option<u32>,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

/// A single external-tool step of a pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Cut the embedded payload out of a composite archive (dd)
    ExtractPayload,
    /// Decompress the cut payload into the staging area
    Decompress,
    /// List the (inner) archive and parse entries
    ListInner,
    /// Extract entries to a destination
    Extract,
    /// Append files to the archive
    Add,
    /// Delete entries from the archive
    Remove,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::ExtractPayload => "extract-payload",
            Stage::Decompress => "decompress",
            Stage::ListInner => "list",
            Stage::Extract => "extract",
            Stage::Add => "add",
            Stage::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// Where a handle's pipeline currently is
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum PipelineState {
    /// No pipeline has run yet
    #[default]
    Idle,
    /// A stage process is live
    Stage(Stage),
    /// Every stage succeeded
    Done,
    /// A stage failed or the pipeline was cancelled
    Aborted,
}

impl PipelineState {
    /// Returns `true` if no further stage will be spawned
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

/// Terminal status of an external command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    /// The process exited with the given code
    Exited(i32),
    /// The process was terminated by the given signal
    Signaled(i32),
}

impl ExitStatus {
    /// Returns `true` if the process exited with code 0
    pub fn is_success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// The exit code, if the process exited normally
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Signaled(_) => None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }

        // Not reachable on unix; other platforms always report a code
        Self::Exited(-1)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Signaled(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Final result of one pipeline run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Every stage succeeded
    Success,
    /// A stage failed; later stages were not spawned
    Failure(StageFailure),
}

impl Outcome {
    /// Returns `true` for [`Outcome::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The failure, if any
    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            Self::Success => None,
            Self::Failure(failure) => Some(failure),
        }
    }
}

/// Whether a handle's entry table can be trusted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    /// Nothing has been listed yet
    #[default]
    Empty,
    /// A listing stage is feeding the table
    InProgress,
    /// The listing ran to a successful end
    Complete,
    /// The listing was cut short; the table is partial
    Incomplete,
}

/// Aggregate counts of a listing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSummary {
    /// Number of non-directory entries
    pub files: u64,
    /// Number of directory entries
    pub dirs: u64,
    /// Sum of all entry sizes
    pub total_size: u64,
}

/// Event emitted while pipelines run
///
/// Subscribe through [`ArchiveManager::subscribe`](crate::ArchiveManager::subscribe).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A stage process was spawned
    StageStarted {
        /// Archive ID
        id: ArchiveId,
        /// The stage that started
        stage: Stage,
    },

    /// A stage process exited and all of its output was consumed
    StageFinished {
        /// Archive ID
        id: ArchiveId,
        /// The stage that finished
        stage: Stage,
        /// How the process terminated
        status: ExitStatus,
    },

    /// A listing line produced an entry
    EntryParsed {
        /// Archive ID
        id: ArchiveId,
        /// The parsed entry
        entry: Entry,
    },

    /// Running totals after an entry was added
    ListingProgress {
        /// Archive ID
        id: ArchiveId,
        /// Counts so far
        summary: ListingSummary,
    },

    /// Every stage of the pipeline succeeded
    Completed {
        /// Archive ID
        id: ArchiveId,
    },

    /// The pipeline was aborted
    Failed {
        /// Archive ID
        id: ArchiveId,
        /// Which stage failed and why
        failure: StageFailure,
    },

    /// The handle was closed and forgotten
    Closed {
        /// Archive ID
        id: ArchiveId,
        /// Path of the archive
        path: PathBuf,
    },
}

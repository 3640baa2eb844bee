//! Pipeline stage descriptions

use std::path::PathBuf;

use crate::listing::ListingFormat;
use crate::process::CommandSpec;
use crate::types::{ExitStatus, Stage};

/// What happens to a stage's standard output
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageRole {
    /// Bytes are written verbatim into a staging file
    ByteSink {
        /// File that receives the output (truncated when the stage starts)
        path: PathBuf,
    },
    /// Lines feed the archive's listing parser
    Listing(ListingFormat),
    /// Lines are traced at debug level and otherwise ignored
    Log,
}

/// When a terminated stage counts as successful
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Completion {
    /// Exit code 0
    #[default]
    ZeroExit,
    /// Any of the listed exit codes
    AcceptCodes(Vec<i32>),
}

impl Completion {
    /// Check a terminal status against the predicate
    ///
    /// A process killed by a signal never satisfies it.
    pub fn is_satisfied(&self, status: ExitStatus) -> bool {
        match (self, status) {
            (_, ExitStatus::Signaled(_)) => false,
            (Completion::ZeroExit, ExitStatus::Exited(code)) => code == 0,
            (Completion::AcceptCodes(codes), ExitStatus::Exited(code)) => codes.contains(&code),
        }
    }
}

/// Lifecycle of a stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StageStatus {
    /// Not spawned yet
    #[default]
    Pending,
    /// Process is live or its output is still draining
    Running,
    /// Completion predicate held
    Succeeded,
    /// Spawn, exit or sink failure
    Failed,
}

/// One external-tool step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineStage {
    /// Stage kind
    pub stage: Stage,
    /// Argument tokens and working directory
    pub command: CommandSpec,
    /// Where stdout goes
    pub role: StageRole,
    /// Success predicate
    pub completion: Completion,
    /// Current lifecycle state
    pub status: StageStatus,
}

impl PipelineStage {
    /// A pending stage that succeeds on exit code 0
    pub fn new(stage: Stage, command: CommandSpec, role: StageRole) -> Self {
        Self {
            stage,
            command,
            role,
            completion: Completion::ZeroExit,
            status: StageStatus::Pending,
        }
    }

    /// Replace the success predicate
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    /// Listing format, when this stage feeds the parser
    pub fn listing_format(&self) -> Option<ListingFormat> {
        match self.role {
            StageRole::Listing(format) => Some(format),
            _ => None,
        }
    }
}

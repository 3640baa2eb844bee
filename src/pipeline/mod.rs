//! Pipeline orchestrator state machine
//!
//! A pipeline is an ordered list of [`PipelineStage`]s run strictly one after
//! another. For a composite (rpm) archive the open pipeline is:
//!
//! 1. ExtractPayload - cut the compressed payload out with `dd`
//! 2. Decompress - decompress it into a staging file
//! 3. ListInner - list the staged cpio archive
//!
//! A stage is finished once its process has exited **and** every stream it
//! registered has closed. Only then is the completion predicate evaluated and
//! the next stage released. Any failure aborts the pipeline: no later stage is
//! spawned and the failure records the stage, its exit status and its error
//! stream. A byte-sink stage that fails, is rejected or is cancelled leaves
//! no staging file behind.
//!
//! This type holds the state only. Spawning and reactor wiring live in the
//! archive manager, which feeds events back through the methods here.

mod stage;

pub use stage::{Completion, PipelineStage, StageRole, StageStatus};

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use tokio_util::sync::CancellationToken;

use crate::error::{FailureReason, StageFailure};
use crate::reactor::{SourceId, StreamEnd};
use crate::types::{ExitStatus, PipelineState, Stage};

#[cfg(test)]
mod tests;

/// Error-stream text retained for a stage, newest lines kept
#[derive(Clone, Debug, Default)]
pub struct DiagnosticBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
    truncated: bool,
}

impl DiagnosticBuffer {
    /// Keep at most `limit` bytes of text
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Append one line, dropping the oldest lines when over the limit
    pub fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
                self.truncated = true;
            }
        }
    }

    /// Returns `true` if older lines were dropped
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Retained text, one line per row
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.bytes);
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            text.push_str(line);
        }
        text
    }
}

/// Result of a settled stage
#[derive(Debug)]
pub struct Settled {
    /// Stage kind
    pub stage: Stage,
    /// What the stage's output fed
    pub role: StageRole,
    /// Terminal status, when the process could be waited on
    pub exit: Option<ExitStatus>,
    /// Set when the stage failed
    pub failure: Option<StageFailure>,
}

struct RunningStage {
    stage: PipelineStage,
    streams: Vec<SourceId>,
    open_streams: usize,
    exit_source: SourceId,
    exit: Option<std::io::Result<ExitStatus>>,
    diagnostic: DiagnosticBuffer,
    sink: Option<BufWriter<File>>,
    sink_error: Option<String>,
    cancel: CancellationToken,
}

/// Reactor sources attached to a running stage
#[derive(Clone, Debug)]
pub struct StageSources {
    /// Output streams (stdout, stderr)
    pub streams: Vec<SourceId>,
    /// Exit watcher
    pub exit: SourceId,
}

/// Sequenced stages of one operation on one archive
pub struct Pipeline {
    pending: VecDeque<PipelineStage>,
    running: Option<RunningStage>,
    finished: Vec<PipelineStage>,
    state: PipelineState,
    failure: Option<StageFailure>,
    spawned: usize,
    max_diagnostic_bytes: usize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("spawned", &self.spawned)
            .field("failure", &self.failure)
            .finish()
    }
}

impl Pipeline {
    /// A pipeline that has not started yet
    pub fn new(stages: Vec<PipelineStage>, max_diagnostic_bytes: usize) -> Self {
        Self {
            pending: stages.into(),
            running: None,
            finished: Vec::new(),
            state: PipelineState::Idle,
            failure: None,
            spawned: 0,
            max_diagnostic_bytes,
        }
    }

    /// Current state
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Returns `true` once Done or Aborted
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of stages whose process was spawned
    pub fn spawned(&self) -> usize {
        self.spawned
    }

    /// Stages not yet started
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Stages that have finished, in order
    pub fn history(&self) -> &[PipelineStage] {
        &self.finished
    }

    /// The failure that aborted the pipeline
    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }

    /// Kind of the running stage
    pub fn running_stage(&self) -> Option<Stage> {
        self.running.as_ref().map(|r| r.stage.stage)
    }

    /// Release the next stage for spawning
    ///
    /// Returns `None` while a stage is running, once the pipeline is terminal,
    /// or when no stage is left (the pipeline then becomes Done).
    pub fn take_next(&mut self) -> Option<PipelineStage> {
        if self.running.is_some() || self.is_terminal() {
            return None;
        }
        let next = self.pending.pop_front();
        if next.is_none() {
            self.state = PipelineState::Done;
        }
        next
    }

    /// Record that `stage` was spawned and its output registered
    pub fn begin(
        &mut self,
        mut stage: PipelineStage,
        sources: StageSources,
        sink: Option<BufWriter<File>>,
        cancel: CancellationToken,
    ) {
        stage.status = StageStatus::Running;
        self.state = PipelineState::Stage(stage.stage);
        self.spawned += 1;
        self.running = Some(RunningStage {
            stage,
            open_streams: sources.streams.len(),
            streams: sources.streams,
            exit_source: sources.exit,
            exit: None,
            diagnostic: DiagnosticBuffer::new(self.max_diagnostic_bytes),
            sink,
            sink_error: None,
            cancel,
        });
    }

    /// Abort with a stage that never got to run
    pub fn reject(
        &mut self,
        mut stage: PipelineStage,
        reason: FailureReason,
        diagnostic: String,
    ) -> StageFailure {
        let failure = StageFailure {
            stage: stage.stage,
            reason,
            exit: None,
            diagnostic,
        };
        discard_sink_output(&stage);
        stage.status = StageStatus::Failed;
        self.finished.push(stage);
        self.abort(failure.clone());
        failure
    }

    fn abort(&mut self, failure: StageFailure) {
        self.pending.clear();
        self.state = PipelineState::Aborted;
        self.failure = Some(failure);
    }

    /// Write a chunk of output into the running stage's sink
    ///
    /// The first write error is kept and fails the stage when it settles;
    /// later chunks are discarded.
    pub fn write_sink(&mut self, bytes: &[u8]) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.sink_error.is_some() {
            return;
        }
        if let Some(sink) = running.sink.as_mut()
            && let Err(e) = sink.write_all(bytes)
        {
            running.sink_error = Some(e.to_string());
        }
    }

    /// Keep one error-stream line of the running stage
    pub fn push_diagnostic(&mut self, line: &str) {
        if let Some(running) = self.running.as_mut() {
            running.diagnostic.push(line);
        }
    }

    /// One of the running stage's streams closed
    pub fn stream_closed(&mut self, end: StreamEnd) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        running.open_streams = running.open_streams.saturating_sub(1);
        if let StreamEnd::Error(e) = end {
            running.diagnostic.push(&format!("read error: {}", e));
        }
    }

    /// The watched process terminated
    ///
    /// Returns `false` if `source` does not belong to the running stage.
    pub fn record_exit(&mut self, source: SourceId, status: std::io::Result<ExitStatus>) -> bool {
        match self.running.as_mut() {
            Some(running) if running.exit_source == source => {
                running.exit = Some(status);
                true
            }
            _ => false,
        }
    }

    /// Returns `true` when the running stage has exited and drained
    pub fn is_settled(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.exit.is_some() && r.open_streams == 0)
    }

    /// Evaluate a finished stage and advance the state machine
    ///
    /// Returns `None` while the running stage is still live. On success the
    /// pipeline becomes Done if no stage is left; on failure it is Aborted.
    pub fn settle(&mut self) -> Option<Settled> {
        if !self.is_settled() {
            return None;
        }
        let mut running = self.running.take()?;

        if let Some(mut sink) = running.sink.take()
            && running.sink_error.is_none()
            && let Err(e) = sink.flush()
        {
            running.sink_error = Some(e.to_string());
        }

        let (exit, reason) = match running.exit.take() {
            Some(Ok(status)) => {
                let reason = if running.cancel.is_cancelled() {
                    Some(FailureReason::Cancelled)
                } else if running.sink_error.is_some() {
                    Some(FailureReason::SinkFailure)
                } else if !running.stage.completion.is_satisfied(status) {
                    Some(FailureReason::NonZeroExit)
                } else {
                    None
                };
                (Some(status), reason)
            }
            Some(Err(e)) => {
                running.diagnostic.push(&format!("wait failed: {}", e));
                (None, Some(FailureReason::NonZeroExit))
            }
            None => (None, Some(FailureReason::NonZeroExit)),
        };

        let mut stage = running.stage;
        let failure = reason.map(|reason| StageFailure {
            stage: stage.stage,
            reason,
            exit,
            diagnostic: match (&running.sink_error, reason) {
                (Some(sink_error), FailureReason::SinkFailure) => sink_error.clone(),
                _ => running.diagnostic.text(),
            },
        });

        if running.diagnostic.is_truncated() {
            tracing::debug!(stage = ?stage.stage, "diagnostic output truncated");
        }

        let settled = Settled {
            stage: stage.stage,
            role: stage.role.clone(),
            exit,
            failure: failure.clone(),
        };

        match failure {
            Some(failure) => {
                discard_sink_output(&stage);
                stage.status = StageStatus::Failed;
                self.finished.push(stage);
                self.abort(failure);
            }
            None => {
                stage.status = StageStatus::Succeeded;
                self.finished.push(stage);
                if self.pending.is_empty() {
                    self.state = PipelineState::Done;
                }
            }
        }

        Some(settled)
    }

    /// Cancel the pipeline
    ///
    /// Trips the running stage's token and drops pending stages. Returns the
    /// sources of the running stage: the caller deregisters its streams and
    /// reaps its exit watcher, which kills the child.
    pub fn cancel(&mut self) -> Option<StageSources> {
        if self.is_terminal() {
            return None;
        }
        let Some(mut running) = self.running.take() else {
            self.abort(StageFailure {
                stage: self
                    .pending
                    .front()
                    .map(|s| s.stage)
                    .unwrap_or(Stage::ListInner),
                reason: FailureReason::Cancelled,
                exit: None,
                diagnostic: String::new(),
            });
            return None;
        };

        running.cancel.cancel();
        drop(running.sink.take());
        let mut stage = running.stage;
        discard_sink_output(&stage);
        stage.status = StageStatus::Failed;
        let failure = StageFailure {
            stage: stage.stage,
            reason: FailureReason::Cancelled,
            exit: None,
            diagnostic: running.diagnostic.text(),
        };
        self.finished.push(stage);
        self.abort(failure);
        Some(StageSources {
            streams: running.streams,
            exit: running.exit_source,
        })
    }
}

/// Remove the partial staging file of a byte-sink stage that did not succeed
///
/// Only regular files are removed; a missing file is fine.
fn discard_sink_output(stage: &PipelineStage) {
    let StageRole::ByteSink { path } = &stage.role else {
        return;
    };
    if !std::fs::symlink_metadata(path).is_ok_and(|m| m.is_file()) {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(stage = ?stage.stage, path = %path.display(), "discarded partial stage output");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                stage = ?stage.stage,
                path = %path.display(),
                error = %e,
                "failed to discard partial stage output"
            );
        }
    }
}

/// Open (truncating) the staging file of a byte-sink stage
pub fn open_sink(stage: &PipelineStage) -> std::io::Result<Option<BufWriter<File>>> {
    match &stage.role {
        StageRole::ByteSink { path } => Ok(Some(BufWriter::new(File::create(path)?))),
        StageRole::Listing(_) | StageRole::Log => Ok(None),
    }
}

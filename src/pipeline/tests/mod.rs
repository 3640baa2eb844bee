// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::listing::ListingFormat;
use crate::process::CommandSpec;
use tempfile::TempDir;

fn stage(kind: Stage, role: StageRole) -> PipelineStage {
    PipelineStage::new(kind, CommandSpec::new("true"), role)
}

fn sources(base: u64) -> StageSources {
    StageSources {
        streams: vec![SourceId(base), SourceId(base + 1)],
        exit: SourceId(base + 2),
    }
}

fn rpm_open_stages(staging: &std::path::Path) -> Vec<PipelineStage> {
    vec![
        stage(Stage::ExtractPayload, StageRole::Log),
        stage(
            Stage::Decompress,
            StageRole::ByteSink {
                path: staging.join("payload.cpio"),
            },
        ),
        stage(Stage::ListInner, StageRole::Listing(ListingFormat::Cpio)),
    ]
}

/// Drive the running stage to exit with `status` and close both streams
fn finish_running(pipeline: &mut Pipeline, exit: SourceId, status: ExitStatus) -> Settled {
    assert!(pipeline.record_exit(exit, Ok(status)));
    assert!(!pipeline.is_settled());
    pipeline.stream_closed(StreamEnd::Eof);
    assert!(!pipeline.is_settled());
    pipeline.stream_closed(StreamEnd::Eof);
    pipeline.settle().unwrap()
}

#[test]
fn empty_pipeline_is_done_immediately() {
    let mut pipeline = Pipeline::new(Vec::new(), 1024);
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert!(pipeline.take_next().is_none());
    assert_eq!(pipeline.state(), PipelineState::Done);
}

#[test]
fn stages_run_in_order_to_done() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(rpm_open_stages(temp.path()), 1024);
    let mut seen = Vec::new();

    let mut base = 0;
    while let Some(next) = pipeline.take_next() {
        let sink = open_sink(&next).unwrap();
        seen.push(next.stage);
        pipeline.begin(next, sources(base), sink, CancellationToken::new());
        assert_eq!(pipeline.state(), PipelineState::Stage(*seen.last().unwrap()));
        // Nothing else is released while a stage runs
        assert!(pipeline.take_next().is_none());

        let settled = finish_running(&mut pipeline, SourceId(base + 2), ExitStatus::Exited(0));
        assert!(settled.failure.is_none());
        base += 3;
    }

    assert_eq!(
        seen,
        vec![Stage::ExtractPayload, Stage::Decompress, Stage::ListInner]
    );
    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(pipeline.spawned(), 3);
    assert!(
        pipeline
            .history()
            .iter()
            .all(|s| s.status == StageStatus::Succeeded)
    );
}

#[test]
fn failed_first_stage_never_releases_second() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(rpm_open_stages(temp.path()), 1024);

    let first = pipeline.take_next().unwrap();
    pipeline.begin(first, sources(0), None, CancellationToken::new());
    pipeline.push_diagnostic("dd: failed to open 'missing.rpm': No such file or directory");

    let settled = finish_running(&mut pipeline, SourceId(2), ExitStatus::Exited(1));
    let failure = settled.failure.unwrap();

    assert_eq!(failure.stage, Stage::ExtractPayload);
    assert_eq!(failure.reason, FailureReason::NonZeroExit);
    assert_eq!(failure.exit, Some(ExitStatus::Exited(1)));
    assert!(failure.diagnostic.contains("No such file"));

    assert_eq!(pipeline.state(), PipelineState::Aborted);
    assert!(pipeline.take_next().is_none());
    assert_eq!(pipeline.spawned(), 1);
    assert_eq!(pipeline.remaining(), 0);
    assert_eq!(pipeline.failure(), Some(&failure));
}

#[test]
fn exit_before_drain_is_not_settled() {
    let mut pipeline = Pipeline::new(vec![stage(Stage::ListInner, StageRole::Log)], 1024);
    let next = pipeline.take_next().unwrap();
    pipeline.begin(next, sources(0), None, CancellationToken::new());

    pipeline.stream_closed(StreamEnd::Eof);
    pipeline.stream_closed(StreamEnd::Eof);
    assert!(!pipeline.is_settled());
    assert!(pipeline.settle().is_none());

    assert!(pipeline.record_exit(SourceId(2), Ok(ExitStatus::Exited(0))));
    assert!(pipeline.settle().is_some());
    assert_eq!(pipeline.state(), PipelineState::Done);
}

#[test]
fn exit_from_foreign_source_is_ignored() {
    let mut pipeline = Pipeline::new(vec![stage(Stage::ListInner, StageRole::Log)], 1024);
    let next = pipeline.take_next().unwrap();
    pipeline.begin(next, sources(10), None, CancellationToken::new());

    assert!(!pipeline.record_exit(SourceId(99), Ok(ExitStatus::Exited(0))));
    assert!(!pipeline.is_settled());
}

#[test]
fn accepted_exit_codes_count_as_success() {
    let lenient = stage(Stage::Extract, StageRole::Log).with_completion(Completion::AcceptCodes(vec![0, 1]));
    let mut pipeline = Pipeline::new(vec![lenient], 1024);
    let next = pipeline.take_next().unwrap();
    pipeline.begin(next, sources(0), None, CancellationToken::new());

    let settled = finish_running(&mut pipeline, SourceId(2), ExitStatus::Exited(1));
    assert!(settled.failure.is_none());
    assert_eq!(pipeline.state(), PipelineState::Done);
}

#[test]
fn sink_receives_chunks_in_order() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("payload.cpio");
    let mut pipeline = Pipeline::new(
        vec![stage(
            Stage::Decompress,
            StageRole::ByteSink { path: path.clone() },
        )],
        1024,
    );

    let next = pipeline.take_next().unwrap();
    let sink = open_sink(&next).unwrap();
    assert!(sink.is_some());
    pipeline.begin(next, sources(0), sink, CancellationToken::new());
    pipeline.write_sink(b"0707");
    pipeline.write_sink(b"01");

    let settled = finish_running(&mut pipeline, SourceId(2), ExitStatus::Exited(0));
    assert!(settled.failure.is_none());
    assert_eq!(std::fs::read(&path).unwrap(), b"070701");
}

#[cfg(target_os = "linux")]
#[test]
fn sink_write_failure_fails_the_stage() {
    let sink_stage = stage(
        Stage::Decompress,
        StageRole::ByteSink {
            path: "/dev/full".into(),
        },
    );
    let mut pipeline = Pipeline::new(
        vec![
            sink_stage,
            stage(Stage::ListInner, StageRole::Listing(ListingFormat::Cpio)),
        ],
        1024,
    );

    let next = pipeline.take_next().unwrap();
    let sink = open_sink(&next).unwrap();
    pipeline.begin(next, sources(0), sink, CancellationToken::new());
    pipeline.write_sink(&[0u8; 64]);

    let settled = finish_running(&mut pipeline, SourceId(2), ExitStatus::Exited(0));
    let failure = settled.failure.unwrap();
    assert_eq!(failure.reason, FailureReason::SinkFailure);
    assert_eq!(failure.exit, Some(ExitStatus::Exited(0)));
    assert!(pipeline.take_next().is_none());
    // Only regular files are discarded
    assert!(std::path::Path::new("/dev/full").exists());
}

#[test]
fn rejected_stage_aborts_without_spawning() {
    let mut pipeline = Pipeline::new(
        vec![
            stage(Stage::ExtractPayload, StageRole::Log),
            stage(Stage::Decompress, StageRole::Log),
        ],
        1024,
    );

    let next = pipeline.take_next().unwrap();
    let failure = pipeline.reject(next, FailureReason::SpawnFailure, "executable dd not found".into());

    assert_eq!(failure.stage, Stage::ExtractPayload);
    assert_eq!(failure.exit, None);
    assert_eq!(pipeline.state(), PipelineState::Aborted);
    assert_eq!(pipeline.spawned(), 0);
    assert!(pipeline.take_next().is_none());
    assert_eq!(pipeline.history()[0].status, StageStatus::Failed);
}

#[test]
fn failed_sink_stage_removes_its_output() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(rpm_open_stages(temp.path()), 1024);
    let staged = temp.path().join("payload.cpio");

    let first = pipeline.take_next().unwrap();
    pipeline.begin(first, sources(0), None, CancellationToken::new());
    finish_running(&mut pipeline, SourceId(2), ExitStatus::Exited(0));

    let second = pipeline.take_next().unwrap();
    let sink = open_sink(&second).unwrap();
    pipeline.begin(second, sources(3), sink, CancellationToken::new());
    pipeline.write_sink(b"070701 truncated");
    pipeline.push_diagnostic("gzip: stdin: invalid compressed data--format violated");
    assert!(staged.is_file());

    let settled = finish_running(&mut pipeline, SourceId(5), ExitStatus::Exited(1));
    assert_eq!(settled.failure.unwrap().stage, Stage::Decompress);
    assert!(!staged.exists());
}

#[test]
fn rejected_sink_stage_removes_its_output() {
    let temp = TempDir::new().unwrap();
    let staged = temp.path().join("payload.cpio");
    let mut pipeline = Pipeline::new(
        vec![stage(
            Stage::Decompress,
            StageRole::ByteSink {
                path: staged.clone(),
            },
        )],
        1024,
    );

    let next = pipeline.take_next().unwrap();
    drop(open_sink(&next).unwrap());
    pipeline.reject(next, FailureReason::SpawnFailure, "executable gzip not found".into());

    assert!(!staged.exists());
}

#[test]
fn cancelled_sink_stage_removes_its_output() {
    let temp = TempDir::new().unwrap();
    let staged = temp.path().join("payload.cpio");
    let mut pipeline = Pipeline::new(
        vec![stage(
            Stage::Decompress,
            StageRole::ByteSink {
                path: staged.clone(),
            },
        )],
        1024,
    );

    let next = pipeline.take_next().unwrap();
    let sink = open_sink(&next).unwrap();
    pipeline.begin(next, sources(0), sink, CancellationToken::new());
    pipeline.write_sink(b"0707");

    assert!(pipeline.cancel().is_some());
    assert!(!staged.exists());
}

#[test]
fn cancel_returns_sources_and_trips_token() {
    let mut pipeline = Pipeline::new(
        vec![
            stage(Stage::ExtractPayload, StageRole::Log),
            stage(Stage::Decompress, StageRole::Log),
        ],
        1024,
    );
    let token = CancellationToken::new();
    let next = pipeline.take_next().unwrap();
    pipeline.begin(next, sources(0), None, token.clone());

    let sources = pipeline.cancel().unwrap();

    assert_eq!(sources.streams, vec![SourceId(0), SourceId(1)]);
    assert_eq!(sources.exit, SourceId(2));
    assert!(token.is_cancelled());
    assert_eq!(pipeline.state(), PipelineState::Aborted);
    assert_eq!(pipeline.failure().unwrap().reason, FailureReason::Cancelled);
    assert_eq!(pipeline.remaining(), 0);
    // The late exit of the killed child no longer matches a running stage
    assert!(!pipeline.record_exit(SourceId(2), Ok(ExitStatus::Signaled(9))));
    // Cancelling twice is harmless
    assert!(pipeline.cancel().is_none());
}

#[test]
fn diagnostic_buffer_keeps_newest_lines() {
    let mut buffer = DiagnosticBuffer::new(12);
    buffer.push("first");
    buffer.push("second");
    buffer.push("third");

    assert!(buffer.is_truncated());
    assert_eq!(buffer.text(), "third");

    let mut roomy = DiagnosticBuffer::new(1024);
    roomy.push("a");
    roomy.push("b");
    assert_eq!(roomy.text(), "a\nb");
    assert!(!roomy.is_truncated());
}

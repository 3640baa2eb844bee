use super::*;
use crate::config::StagingConfig;
use crate::error::FailureReason;
use crate::listing::ListingFormat;
use crate::process::CommandSpec;
use crate::types::{ListingStatus, Stage};
use tempfile::TempDir;
use tokio::sync::broadcast::Receiver;

fn manager(temp: &TempDir) -> ArchiveManager {
    let config = Config {
        staging: StagingConfig {
            staging_dir: temp.path().join("staging"),
        },
        ..Default::default()
    };
    ArchiveManager::new(config).unwrap()
}

fn sh(stage: Stage, script: &str, role: StageRole) -> PipelineStage {
    PipelineStage::new(
        stage,
        CommandSpec::new("sh").arg("-c").arg(script),
        role,
    )
}

fn drain_events(rx: &mut Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// A registered (not yet existing) archive to hang custom pipelines on
async fn scratch_handle(manager: &mut ArchiveManager, temp: &TempDir) -> ArchiveId {
    manager.create(temp.path().join("scratch.tar")).await.unwrap()
}

const LISTING_SCRIPT: &str = "\
printf '%s\\n' \
'drwxr-xr-x root/root 0 2024-03-01 09:00 project/' \
'-rw-r--r-- root/root 1536 2024-03-01 09:01 project/README.md' \
'-rw-r--r-- root/root 512 2024-03-01 09:02 project/my notes.txt'";

#[tokio::test]
async fn failing_first_stage_never_spawns_second() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = scratch_handle(&mut manager, &temp).await;
    let marker = temp.path().join("second-ran");

    manager
        .submit(
            id,
            vec![
                sh(Stage::ExtractPayload, "echo 'dd: broken' >&2; exit 1", StageRole::Log),
                sh(
                    Stage::Decompress,
                    &format!("touch '{}'", marker.display()),
                    StageRole::Log,
                ),
            ],
        )
        .unwrap();
    let outcome = manager.wait(id).await.unwrap();

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.stage, Stage::ExtractPayload);
    assert_eq!(failure.reason, FailureReason::NonZeroExit);
    assert_eq!(failure.exit, Some(crate::types::ExitStatus::Exited(1)));
    assert_eq!(failure.diagnostic, "dd: broken");
    assert!(!marker.exists());

    let handle = manager.handle(id).unwrap();
    assert_eq!(handle.pipeline.as_ref().unwrap().spawned(), 1);
    assert_eq!(handle.state(), PipelineState::Aborted);
}

#[tokio::test]
async fn stages_run_sequentially_and_complete() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let mut rx = manager.subscribe();
    let id = scratch_handle(&mut manager, &temp).await;
    let staged = temp.path().join("payload.cpio");

    manager
        .submit(
            id,
            vec![
                sh(
                    Stage::Decompress,
                    "printf 'staged-bytes'",
                    StageRole::ByteSink {
                        path: staged.clone(),
                    },
                ),
                // Reads the file the previous stage wrote
                sh(
                    Stage::ListInner,
                    &format!("test \"$(cat '{}')\" = staged-bytes", staged.display()),
                    StageRole::Log,
                ),
            ],
        )
        .unwrap();

    assert!(manager.wait(id).await.unwrap().is_success());
    assert_eq!(std::fs::read(&staged).unwrap(), b"staged-bytes");

    let events = drain_events(&mut rx);
    let stages: Vec<Stage> = events
        .iter()
        .filter_map(|e| match e {
            Event::StageStarted { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(stages, vec![Stage::Decompress, Stage::ListInner]);
    assert!(matches!(events.last(), Some(Event::Completed { id: done }) if *done == id));
}

#[tokio::test]
async fn listing_stage_fills_handle_and_emits_progress() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let mut rx = manager.subscribe();
    let id = scratch_handle(&mut manager, &temp).await;

    manager
        .submit(
            id,
            vec![sh(
                Stage::ListInner,
                LISTING_SCRIPT,
                StageRole::Listing(ListingFormat::Tar),
            )],
        )
        .unwrap();
    manager.wait(id).await.unwrap();

    let handle = manager.handle(id).unwrap();
    assert_eq!(handle.listing_status(), ListingStatus::Complete);
    assert_eq!(handle.entries().len(), 3);
    assert_eq!(handle.entries()[2].name, "project/my notes.txt");
    let summary = handle.summary();
    assert_eq!((summary.files, summary.dirs, summary.total_size), (2, 1, 2048));

    let events = drain_events(&mut rx);
    let parsed = events
        .iter()
        .filter(|e| matches!(e, Event::EntryParsed { .. }))
        .count();
    assert_eq!(parsed, 3);
    let last_progress = events.iter().rev().find_map(|e| match e {
        Event::ListingProgress { summary, .. } => Some(*summary),
        _ => None,
    });
    assert_eq!(last_progress, Some(summary));
}

#[tokio::test]
async fn failed_listing_is_marked_incomplete() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = scratch_handle(&mut manager, &temp).await;

    manager
        .submit(
            id,
            vec![sh(
                Stage::ListInner,
                "echo '-rw-r--r-- root/root 7 2024-03-01 09:01 first.txt'; \
                 echo 'tar: Unexpected EOF in archive' >&2; exit 2",
                StageRole::Listing(ListingFormat::Tar),
            )],
        )
        .unwrap();
    let outcome = manager.wait(id).await.unwrap();

    let handle = manager.handle(id).unwrap();
    assert_eq!(handle.listing_status(), ListingStatus::Incomplete);
    assert_eq!(handle.entries().len(), 1);
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.exit, Some(crate::types::ExitStatus::Exited(2)));
    assert!(failure.diagnostic.contains("Unexpected EOF"));
    assert_eq!(handle.last_failure(), Some(failure));
}

#[tokio::test]
async fn missing_executable_is_a_spawn_failure() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = scratch_handle(&mut manager, &temp).await;

    manager
        .submit(
            id,
            vec![PipelineStage::new(
                Stage::ExtractPayload,
                CommandSpec::new("/nonexistent/bin/dd").arg("if=x"),
                StageRole::Log,
            )],
        )
        .unwrap();
    let outcome = manager.wait(id).await.unwrap();

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.reason, FailureReason::SpawnFailure);
    assert_eq!(failure.exit, None);
    assert!(failure.diagnostic.contains("not found"));
    assert_eq!(manager.handle(id).unwrap().pipeline.as_ref().unwrap().spawned(), 0);
}

#[tokio::test]
async fn missing_working_directory_is_a_spawn_failure() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = scratch_handle(&mut manager, &temp).await;
    let host_cwd = std::env::current_dir().unwrap();

    manager
        .submit(
            id,
            vec![PipelineStage::new(
                Stage::Extract,
                CommandSpec::new("true").current_dir(temp.path().join("gone")),
                StageRole::Log,
            )],
        )
        .unwrap();
    let outcome = manager.wait(id).await.unwrap();

    assert_eq!(outcome.failure().unwrap().reason, FailureReason::SpawnFailure);
    assert_eq!(std::env::current_dir().unwrap(), host_cwd);
}

#[tokio::test]
async fn second_pipeline_on_busy_handle_is_rejected() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = scratch_handle(&mut manager, &temp).await;

    manager
        .submit(id, vec![sh(Stage::Extract, "sleep 30", StageRole::Log)])
        .unwrap();
    let err = manager
        .submit(id, vec![sh(Stage::Extract, "true", StageRole::Log)])
        .unwrap_err();
    assert!(matches!(err, Error::Busy(busy) if busy == id));
    assert!(matches!(manager.remove(id, &[]), Err(Error::Busy(_))));

    manager.close(id).await.unwrap();
}

#[tokio::test]
async fn close_cancels_running_stage() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let mut rx = manager.subscribe();
    let id = scratch_handle(&mut manager, &temp).await;
    let marker = temp.path().join("second-ran");

    manager
        .submit(
            id,
            vec![
                sh(Stage::ListInner, "echo started; sleep 30", StageRole::Listing(ListingFormat::Tar)),
                sh(Stage::Extract, &format!("touch '{}'", marker.display()), StageRole::Log),
            ],
        )
        .unwrap();
    manager.close(id).await.unwrap();

    assert!(manager.handle(id).is_none());
    assert!(matches!(manager.wait(id).await, Err(Error::NotFound(_))));
    // The killed child is already reaped and nothing else is spawned
    assert!(manager.reactor.is_idle());
    assert!(manager.routes.is_empty());
    assert!(!marker.exists());

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Failed { failure, .. } if failure.reason == FailureReason::Cancelled
    )));
    assert!(matches!(events.last(), Some(Event::Closed { .. })));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn close_kills_running_tool_before_returning() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = scratch_handle(&mut manager, &temp).await;
    let pid_file = temp.path().join("tool.pid");

    manager
        .submit(
            id,
            vec![sh(
                Stage::Extract,
                &format!("echo $$ > '{}'; exec sleep 30", pid_file.display()),
                StageRole::Log,
            )],
        )
        .unwrap();

    // Wait for the tool to start without driving the reactor
    let pid = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok())
            {
                return pid;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(Path::new(&format!("/proc/{pid}")).exists());

    manager.close(id).await.unwrap();

    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    assert!(manager.reactor.is_idle());
}

#[tokio::test]
async fn pipelines_on_different_handles_run_concurrently() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let first = manager.create(temp.path().join("a.tar")).await.unwrap();
    let second = manager.create(temp.path().join("b.tar")).await.unwrap();

    for id in [first, second] {
        manager
            .submit(
                id,
                vec![sh(
                    Stage::ListInner,
                    LISTING_SCRIPT,
                    StageRole::Listing(ListingFormat::Tar),
                )],
            )
            .unwrap();
    }
    manager.run_until_idle().await;

    for id in [first, second] {
        let handle = manager.handle(id).unwrap();
        assert_eq!(handle.outcome(), Some(&Outcome::Success));
        assert_eq!(handle.entries().len(), 3);
    }
}

#[tokio::test]
async fn accepted_exit_codes_are_honoured() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = scratch_handle(&mut manager, &temp).await;

    manager
        .submit(
            id,
            vec![
                sh(Stage::Extract, "exit 1", StageRole::Log)
                    .with_completion(crate::pipeline::Completion::AcceptCodes(vec![0, 1])),
            ],
        )
        .unwrap();
    assert!(manager.wait(id).await.unwrap().is_success());
}

#[tokio::test]
async fn handle_without_pipeline_waits_successfully() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = scratch_handle(&mut manager, &temp).await;

    assert_eq!(manager.wait(id).await.unwrap(), Outcome::Success);
    assert_eq!(manager.handle(id).unwrap().state(), PipelineState::Idle);
}

#[tokio::test]
async fn create_refuses_existing_file() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let path = temp.path().join("exists.tar");
    std::fs::write(&path, b"").unwrap();

    let err = manager.create(&path).await.unwrap_err();
    assert_eq!(err.error_code(), "io_error");
}

#[tokio::test]
async fn open_rejects_unknown_files() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let path = temp.path().join("notes.txt");
    std::fs::write(&path, b"hello").unwrap();

    let err = manager.open(&path).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
    assert_eq!(manager.handles().count(), 0);
}

#[tokio::test]
async fn bad_rpm_header_fails_before_any_stage() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let mut rx = manager.subscribe();
    let path = temp.path().join("broken.rpm");
    let mut bytes = vec![0u8; 100];
    bytes[..4].copy_from_slice(&rpm::LEAD_MAGIC);
    std::fs::write(&path, bytes).unwrap();

    let err = manager.open(&path).await.unwrap_err();
    assert_eq!(err.error_code(), "header_truncated");
    assert_eq!(manager.handles().count(), 0);
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn rpm_handles_reject_add_and_remove() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let id = manager.allocate_id();
    manager.session.handles.insert(
        id,
        ArchiveHandle::new(id, temp.path().join("pkg.rpm"), ArchiveKind::Rpm),
    );

    let err = manager
        .add(id, &[temp.path().join("file.txt")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
    assert!(matches!(manager.remove(id, &[]), Err(Error::NotSupported(_))));
}

#[tokio::test]
async fn unknown_handle_is_not_found() {
    let temp = TempDir::new().unwrap();
    let mut manager = manager(&temp);
    let ghost = ArchiveId(42);

    assert!(matches!(manager.close(ghost).await, Err(Error::NotFound(_))));
    assert!(matches!(manager.submit(ghost, Vec::new()), Err(Error::NotFound(_))));
    assert!(matches!(manager.reload(ghost).await, Err(Error::NotFound(_))));
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = Config::default();
    config.event_channel_capacity = 0;
    assert!(matches!(ArchiveManager::new(config), Err(Error::Config { .. })));
}

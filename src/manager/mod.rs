//! Archive manager: handles, pipelines and the reactor that drives them
//!
//! The `ArchiveManager` owns every open [`ArchiveHandle`], one [`Reactor`]
//! shared by all of them, and the staging area. Nothing runs in the
//! background: pipelines advance only while the owner drives the reactor
//! through [`wait`](ArchiveManager::wait),
//! [`run_until_idle`](ArchiveManager::run_until_idle) or
//! [`turn`](ArchiveManager::turn). Many handles may have live pipelines at
//! once; each handle has at most one.
//!
//! Methods are grouped by concern:
//! - this module - construction, open/create/close, driving the reactor
//! - `operations` - extract, add, remove, reload and custom stage lists
//! - `session` - the context stream handlers mutate

mod operations;
mod session;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::ArchiveHandle;
use crate::config::Config;
use crate::error::{Error, FailureReason, Result};
use crate::formats::{self, rpm, tar};
use crate::pipeline::{self, Pipeline, PipelineStage, StageRole, StageSources};
use crate::reactor::{Handler, Reactor, SourceId, Turn};
use crate::staging::{DirStaging, StagingArea};
use crate::types::{ArchiveId, ArchiveKind, Event, Outcome, PipelineState};

use session::Session;

/// Owner of archive handles and the output reactor
pub struct ArchiveManager {
    config: Arc<Config>,
    reactor: Reactor<Session>,
    session: Session,
    /// Which archive each live source belongs to
    routes: HashMap<SourceId, ArchiveId>,
    staging: Arc<dyn StagingArea>,
    next_id: u64,
}

impl ArchiveManager {
    /// Create a manager staging under `config.staging_dir`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use arcpipe::{ArchiveManager, Config};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> arcpipe::Result<()> {
    /// let mut manager = ArchiveManager::new(Config::default())?;
    /// let id = manager.open("backup.tar.gz").await?;
    /// manager.wait(id).await?;
    /// for entry in manager.handle(id).map(|h| h.entries()).unwrap_or_default() {
    ///     println!("{} {}", entry.size, entry.name);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        let staging = Arc::new(DirStaging::new(config.staging_dir().clone()));
        Self::with_staging(config, staging)
    }

    /// Create a manager with a custom staging area
    pub fn with_staging(config: Config, staging: Arc<dyn StagingArea>) -> Result<Self> {
        config.validate()?;
        let (event_tx, _rx) = broadcast::channel(config.event_channel_capacity);
        debug!(staging = staging.name(), "archive manager created");

        Ok(Self {
            reactor: Reactor::new(config.reactor.chunk_size),
            session: Session::new(event_tx),
            routes: HashMap::new(),
            staging,
            next_id: 1,
            config: Arc::new(config),
        })
    }

    /// Subscribe to pipeline events
    ///
    /// Events sent before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.session.event_tx.subscribe()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look up a handle
    pub fn handle(&self, id: ArchiveId) -> Option<&ArchiveHandle> {
        self.session.handles.get(&id)
    }

    /// All open handles, in no particular order
    pub fn handles(&self) -> impl Iterator<Item = &ArchiveHandle> {
        self.session.handles.values()
    }

    fn allocate_id(&mut self) -> ArchiveId {
        let id = ArchiveId(self.next_id);
        self.next_id += 1;
        id
    }

    fn emit(&self, event: Event) {
        self.session.event_tx.send(event).ok();
    }

    /// Open an archive and start listing it
    ///
    /// For tar archives this spawns `tar -tvf`. For RPM packages the header is
    /// validated first, then the payload is cut out, decompressed into the
    /// staging area and listed with cpio. The listing fills in as the caller
    /// drives the reactor.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    /// - [`Error::HeaderLayout`] if an RPM header does not describe a payload
    /// - [`Error::NotSupported`] for files that are neither tar nor RPM
    pub async fn open(&mut self, path: impl AsRef<Path>) -> Result<ArchiveId> {
        let path = std::path::absolute(path.as_ref())?;
        let kind = formats::detect_kind(&path).await?;
        if kind == ArchiveKind::Other {
            return Err(Error::NotSupported(format!(
                "{} is not a tar archive or rpm package",
                path.display()
            )));
        }

        let id = self.allocate_id();
        let mut handle = ArchiveHandle::new(id, path.clone(), kind);
        let stages = match kind {
            ArchiveKind::Rpm => {
                let layout = rpm::read_payload_layout(&path).await?;
                let staging = self.staging.prepare(id).await?;
                let stages = rpm::open_plan(&self.config.tools, &path, layout, &staging);
                handle.set_payload(layout);
                handle.set_staging_dir(staging);
                stages
            }
            _ => tar::list_plan(&self.config.tools, &path),
        };

        info!(archive_id = id.0, ?kind, path = %path.display(), "opening archive");
        self.session.handles.insert(id, handle);
        self.start(id, stages)?;
        Ok(id)
    }

    /// Register a tar archive that does not exist yet
    ///
    /// The file is created by the first [`add`](Self::add).
    ///
    /// # Errors
    ///
    /// Returns an `AlreadyExists` I/O error if something is at `path`.
    pub async fn create(&mut self, path: impl AsRef<Path>) -> Result<ArchiveId> {
        let path = std::path::absolute(path.as_ref())?;
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }

        let id = self.allocate_id();
        info!(archive_id = id.0, path = %path.display(), "registered new archive");
        self.session
            .handles
            .insert(id, ArchiveHandle::new(id, path, ArchiveKind::Tar));
        Ok(id)
    }

    /// Close a handle, cancelling its pipeline
    ///
    /// Live streams are deregistered, the running tool is killed, partial
    /// listing state is discarded and the staging directory is released.
    pub async fn close(&mut self, id: ArchiveId) -> Result<()> {
        let mut handle = self.session.handles.remove(&id).ok_or(Error::NotFound(id))?;

        if let Some(pipeline) = handle.pipeline.as_mut() {
            let was_live = !pipeline.is_terminal();
            if let Some(sources) = pipeline.cancel() {
                for source in sources.streams {
                    self.reactor.deregister(source);
                    self.routes.remove(&source);
                }
                // The child is killed and reaped before its staging goes away
                self.routes.remove(&sources.exit);
                match self.reactor.reap(sources.exit).await {
                    Some(Ok(status)) => {
                        debug!(archive_id = id.0, ?status, "reaped cancelled tool");
                    }
                    Some(Err(e)) => {
                        warn!(archive_id = id.0, error = %e, "failed to reap cancelled tool");
                    }
                    None => {}
                }
            }
            if was_live && let Some(failure) = pipeline.failure().cloned() {
                info!(archive_id = id.0, stage = ?failure.stage, "cancelled running pipeline");
                self.emit(Event::Failed { id, failure });
            }
        }
        handle.discard_listing();

        if handle.staging_dir().is_some()
            && let Err(e) = self.staging.release(id).await
        {
            warn!(archive_id = id.0, error = %e, "failed to release staging directory");
        }

        info!(archive_id = id.0, path = %handle.path().display(), "closed archive");
        self.emit(Event::Closed {
            id,
            path: handle.path().to_path_buf(),
        });
        Ok(())
    }

    /// Install `stages` as the handle's pipeline and spawn the first one
    fn start(&mut self, id: ArchiveId, stages: Vec<PipelineStage>) -> Result<()> {
        let handle = self.session.handles.get_mut(&id).ok_or(Error::NotFound(id))?;
        if handle.is_busy() {
            return Err(Error::Busy(id));
        }
        handle.start_pipeline(Pipeline::new(
            stages,
            self.config.reactor.max_diagnostic_bytes,
        ));
        self.advance(id);
        Ok(())
    }

    /// Spawn the next stage if one is due, then publish a terminal outcome
    fn advance(&mut self, id: ArchiveId) {
        let next = self
            .session
            .handles
            .get_mut(&id)
            .and_then(|h| h.pipeline.as_mut())
            .and_then(Pipeline::take_next);
        if let Some(stage) = next {
            self.launch(id, stage);
        }
        self.conclude(id);
    }

    /// Spawn one stage and register its streams and exit with the reactor
    fn launch(&mut self, id: ArchiveId, stage: PipelineStage) {
        let Some(handle) = self.session.handles.get_mut(&id) else {
            return;
        };

        let sink = match pipeline::open_sink(&stage) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(archive_id = id.0, stage = ?stage.stage, error = %e, "cannot open stage output file");
                if let Some(pipeline) = handle.pipeline.as_mut() {
                    pipeline.reject(stage, FailureReason::SinkFailure, e.to_string());
                }
                return;
            }
        };

        let mut process = match stage.command.spawn() {
            Ok(process) => process,
            Err(e) => {
                warn!(archive_id = id.0, stage = ?stage.stage, error = %e, "cannot spawn stage");
                if let Some(pipeline) = handle.pipeline.as_mut() {
                    pipeline.reject(stage, FailureReason::SpawnFailure, e.to_string());
                }
                return;
            }
        };

        let feeds_listing = stage.listing_format().is_some();
        if let Some(format) = stage.listing_format() {
            handle.begin_listing(format);
        }

        let mut streams = Vec::with_capacity(2);
        if let Some(stdout) = process.take_stdout() {
            let handler = match &stage.role {
                StageRole::ByteSink { .. } => {
                    Handler::chunks(move |s: &mut Session, chunk| s.sink_chunk(id, chunk))
                }
                StageRole::Listing(_) => {
                    Handler::lines(move |s: &mut Session, line| s.listing_line(id, line))
                }
                StageRole::Log => {
                    Handler::lines(move |s: &mut Session, line| s.output_line(id, line))
                }
            };
            streams.push(self.reactor.register(stdout, handler, move |s: &mut Session, end| {
                s.stream_closed(id, feeds_listing, end)
            }));
        }
        if let Some(stderr) = process.take_stderr() {
            streams.push(self.reactor.register(
                stderr,
                Handler::lines(move |s: &mut Session, line| s.diagnostic_line(id, line)),
                move |s: &mut Session, end| s.stream_closed(id, false, end),
            ));
        }

        let cancel = CancellationToken::new();
        let exit = self.reactor.watch_exit(process.into_child(), cancel.clone());
        for source in streams.iter().chain(std::iter::once(&exit)) {
            self.routes.insert(*source, id);
        }

        debug!(
            archive_id = id.0,
            stage = ?stage.stage,
            command = %stage.command,
            "stage started"
        );
        let kind = stage.stage;
        if let Some(pipeline) = handle.pipeline.as_mut() {
            pipeline.begin(stage, StageSources { streams, exit }, sink, cancel);
        }
        self.emit(Event::StageStarted { id, stage: kind });
    }

    /// Evaluate the running stage once it has exited and drained
    fn settle(&mut self, id: ArchiveId) {
        let Some(handle) = self.session.handles.get_mut(&id) else {
            return;
        };
        let Some(settled) = handle.pipeline.as_mut().and_then(Pipeline::settle) else {
            return;
        };

        if matches!(settled.role, StageRole::Listing(_)) {
            handle.end_listing(settled.failure.is_none());
        }
        if let Some(failure) = &settled.failure {
            warn!(
                archive_id = id.0,
                stage = ?failure.stage,
                reason = %failure.reason,
                exit = ?failure.exit,
                diagnostic = %failure.diagnostic,
                "stage failed"
            );
        } else {
            debug!(archive_id = id.0, stage = ?settled.stage, "stage succeeded");
        }
        if let Some(status) = settled.exit {
            self.emit(Event::StageFinished {
                id,
                stage: settled.stage,
                status,
            });
        }

        self.advance(id);
    }

    /// Record the outcome of a pipeline that just became terminal
    fn conclude(&mut self, id: ArchiveId) {
        let Some(handle) = self.session.handles.get_mut(&id) else {
            return;
        };
        if handle.outcome().is_some() {
            return;
        }
        let Some(pipeline) = handle.pipeline.as_ref() else {
            return;
        };

        let outcome = match (pipeline.state(), pipeline.failure()) {
            (PipelineState::Done, _) => Outcome::Success,
            (PipelineState::Aborted, Some(failure)) => Outcome::Failure(failure.clone()),
            _ => return,
        };

        handle.end_listing(outcome.is_success());
        handle.finish(outcome.clone());

        match outcome {
            Outcome::Success => {
                info!(archive_id = id.0, "pipeline completed");
                self.emit(Event::Completed { id });
            }
            Outcome::Failure(failure) => {
                warn!(archive_id = id.0, stage = ?failure.stage, "pipeline aborted");
                self.emit(Event::Failed { id, failure });
            }
        }
    }

    /// Run one reactor turn
    ///
    /// Returns `false` when nothing is registered, i.e. no pipeline is live.
    pub async fn turn(&mut self) -> bool {
        match self.reactor.turn(&mut self.session).await {
            Turn::Idle => false,
            Turn::Dispatched(_) => true,
            Turn::Closed(source) => {
                if let Some(id) = self.routes.remove(&source) {
                    self.settle(id);
                }
                true
            }
            Turn::Exited { source, status } => {
                match self.routes.remove(&source) {
                    Some(id) => {
                        let recorded = self
                            .session
                            .handles
                            .get_mut(&id)
                            .and_then(|h| h.pipeline.as_mut())
                            .is_some_and(|p| p.record_exit(source, status));
                        if recorded {
                            self.settle(id);
                        }
                    }
                    None => debug!(%source, "exit of a forgotten stage"),
                }
                true
            }
        }
    }

    /// Drive the reactor until `id`'s pipeline is terminal
    ///
    /// Other handles' pipelines advance too. A handle that never ran a
    /// pipeline reports success immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the handle does not exist or is closed
    /// while waiting.
    pub async fn wait(&mut self, id: ArchiveId) -> Result<Outcome> {
        loop {
            let handle = self.session.handles.get(&id).ok_or(Error::NotFound(id))?;
            if !handle.is_busy() {
                return Ok(handle.outcome().cloned().unwrap_or(Outcome::Success));
            }
            if !self.turn().await {
                // A live pipeline always has its exit watcher registered
                return Err(Error::Io(std::io::Error::other(format!(
                    "archive {} has a live pipeline but nothing to wait on",
                    id
                ))));
            }
        }
    }

    /// Drive the reactor until no pipeline is live
    pub async fn run_until_idle(&mut self) {
        while self.turn().await {}
    }
}

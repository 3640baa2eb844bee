//! Output reactor: cooperative multiplexing of tool output and process exits
//!
//! The reactor owns every registered source (stdout/stderr streams and exit
//! watchers) in one [`StreamMap`]. Each call to [`Reactor::turn`] waits for
//! the next ready source and dispatches exactly one unit to its handler: a
//! line, a chunk, a close notification or an exit status. Handlers run
//! synchronously and receive `&mut C`, the owner's context, so they can
//! update owner state without shared ownership or locks.
//!
//! Within one source, delivery order equals emission order. There is no
//! ordering across sources.

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;

use crate::types::ExitStatus;

/// Identifier of a registered source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub(crate) u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// How a stream ended
#[derive(Debug)]
pub enum StreamEnd {
    /// Orderly end of stream
    Eof,
    /// The stream failed; it is closed all the same
    Error(std::io::Error),
}

/// Per-line handler
pub type LineHandler<C> = Box<dyn FnMut(&mut C, &str) + Send>;
/// Per-chunk handler
pub type ChunkHandler<C> = Box<dyn FnMut(&mut C, &[u8]) + Send>;
/// Close notification, invoked exactly once per stream
pub type CloseHandler<C> = Box<dyn FnOnce(&mut C, StreamEnd) + Send>;

/// How a stream's data is framed and delivered
pub enum Handler<C> {
    /// One call per newline-terminated line (terminator stripped, lossy UTF-8)
    Lines(LineHandler<C>),
    /// One call per read of at most `chunk_size` bytes
    Chunks(ChunkHandler<C>),
}

impl<C> Handler<C> {
    /// Line-framed handler
    pub fn lines(f: impl FnMut(&mut C, &str) + Send + 'static) -> Self {
        Self::Lines(Box::new(f))
    }

    /// Chunk-framed handler
    pub fn chunks(f: impl FnMut(&mut C, &[u8]) + Send + 'static) -> Self {
        Self::Chunks(Box::new(f))
    }
}

/// What a single turn did
#[derive(Debug)]
pub enum Turn {
    /// No sources are registered
    Idle,
    /// A line or chunk was handed to the source's handler
    Dispatched(SourceId),
    /// The stream closed and its close handler ran
    Closed(SourceId),
    /// A watched process terminated
    Exited {
        /// The exit watcher's source ID
        source: SourceId,
        /// Exit status, or the error from waiting on the child
        status: std::io::Result<ExitStatus>,
    },
}

enum SourceEvent {
    Data(Vec<u8>),
    Closed(Option<std::io::Error>),
    Exited(std::io::Result<ExitStatus>),
}

struct Registration<C> {
    handler: Handler<C>,
    on_close: CloseHandler<C>,
}

/// Single-owner event loop over process output
pub struct Reactor<C> {
    sources: StreamMap<SourceId, BoxStream<'static, SourceEvent>>,
    registrations: HashMap<SourceId, Registration<C>>,
    next_id: u64,
    chunk_size: usize,
}

impl<C> Reactor<C> {
    /// Create a reactor reading at most `chunk_size` bytes per chunk dispatch
    pub fn new(chunk_size: usize) -> Self {
        Self {
            sources: StreamMap::new(),
            registrations: HashMap::new(),
            next_id: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    fn allocate(&mut self) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a stream with a data handler and a close handler
    pub fn register<R>(
        &mut self,
        reader: R,
        handler: Handler<C>,
        on_close: impl FnOnce(&mut C, StreamEnd) + Send + 'static,
    ) -> SourceId
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let id = self.allocate();
        let source = match handler {
            Handler::Lines(_) => line_source(reader),
            Handler::Chunks(_) => chunk_source(reader, self.chunk_size),
        };
        self.sources.insert(id, source);
        self.registrations.insert(
            id,
            Registration {
                handler,
                on_close: Box::new(on_close),
            },
        );
        id
    }

    /// Watch a child for termination
    ///
    /// When `cancel` fires first, the child is killed and reaped; the turn
    /// then reports the resulting signal status.
    pub fn watch_exit(&mut self, child: Child, cancel: CancellationToken) -> SourceId {
        let id = self.allocate();
        self.sources.insert(id, exit_source(child, cancel));
        id
    }

    /// Remove a source without notifying its close handler
    ///
    /// Returns `false` if the source had already closed.
    pub fn deregister(&mut self, source: SourceId) -> bool {
        self.registrations.remove(&source);
        self.sources.remove(&source).is_some()
    }

    /// Take an exit watcher out of the reactor and wait for it here
    ///
    /// If the watcher's token has fired, the child is killed; either way it
    /// is reaped before this returns. Returns `None` for a source that is not
    /// a live exit watcher.
    pub async fn reap(&mut self, source: SourceId) -> Option<std::io::Result<ExitStatus>> {
        if self.registrations.contains_key(&source) {
            return None;
        }
        let mut watcher = self.sources.remove(&source)?;
        match watcher.next().await {
            Some(SourceEvent::Exited(status)) => Some(status),
            _ => None,
        }
    }

    /// Number of live sources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if nothing is registered
    pub fn is_idle(&self) -> bool {
        self.sources.is_empty()
    }

    /// Wait for the next ready source and dispatch one unit from it
    ///
    /// Cancel-safe: dropping the future before it completes loses no data.
    pub async fn turn(&mut self, ctx: &mut C) -> Turn {
        let Some((source, event)) = self.sources.next().await else {
            return Turn::Idle;
        };

        match event {
            SourceEvent::Data(bytes) => {
                if let Some(registration) = self.registrations.get_mut(&source) {
                    match &mut registration.handler {
                        Handler::Lines(on_line) => {
                            let text = String::from_utf8_lossy(&bytes);
                            on_line(ctx, text.trim_end_matches(['\n', '\r']));
                        }
                        Handler::Chunks(on_chunk) => on_chunk(ctx, &bytes),
                    }
                }
                Turn::Dispatched(source)
            }
            SourceEvent::Closed(error) => {
                if let Some(registration) = self.registrations.remove(&source) {
                    let end = match error {
                        None => StreamEnd::Eof,
                        Some(e) => StreamEnd::Error(e),
                    };
                    (registration.on_close)(ctx, end);
                }
                Turn::Closed(source)
            }
            SourceEvent::Exited(status) => Turn::Exited { source, status },
        }
    }
}

fn line_source<R>(reader: R) -> BoxStream<'static, SourceEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(BufReader::new(reader)), |state| async move {
        let mut reader = state?;
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => Some((SourceEvent::Closed(None), None)),
            Ok(_) => Some((SourceEvent::Data(line), Some(reader))),
            Err(e) => Some((SourceEvent::Closed(Some(e)), None)),
        }
    })
    .boxed()
}

fn chunk_source<R>(reader: R, chunk_size: usize) -> BoxStream<'static, SourceEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; chunk_size];
        match reader.read(&mut buf).await {
            Ok(0) => Some((SourceEvent::Closed(None), None)),
            Ok(n) => {
                buf.truncate(n);
                Some((SourceEvent::Data(buf), Some(reader)))
            }
            Err(e) => Some((SourceEvent::Closed(Some(e)), None)),
        }
    })
    .boxed()
}

fn exit_source(mut child: Child, cancel: CancellationToken) -> BoxStream<'static, SourceEvent> {
    stream::once(async move {
        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match finished {
            Some(status) => status,
            None => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill cancelled tool");
                }
                child.wait().await
            }
        };

        SourceEvent::Exited(status.map(ExitStatus::from))
    })
    .boxed()
}

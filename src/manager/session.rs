//! Reactor context: the state handlers mutate while output streams in

use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::archive::ArchiveHandle;
use crate::pipeline::Pipeline;
use crate::reactor::StreamEnd;
use crate::types::{ArchiveId, Event};

/// Everything a stream handler may touch
///
/// Handlers are registered per stage and capture only the archive ID; the
/// reactor passes the session in on every dispatch.
pub(crate) struct Session {
    pub(crate) handles: HashMap<ArchiveId, ArchiveHandle>,
    pub(crate) event_tx: broadcast::Sender<Event>,
}

impl Session {
    pub(crate) fn new(event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            handles: HashMap::new(),
            event_tx,
        }
    }

    fn pipeline_mut(&mut self, id: ArchiveId) -> Option<&mut Pipeline> {
        self.handles.get_mut(&id)?.pipeline.as_mut()
    }

    /// Listing stage stdout: parse, record, report progress
    pub(crate) fn listing_line(&mut self, id: ArchiveId, line: &str) {
        let Some(handle) = self.handles.get_mut(&id) else {
            return;
        };
        let Some(entry) = handle.listing_mut().on_line(line).cloned() else {
            return;
        };
        let summary = handle.summary();

        self.event_tx.send(Event::EntryParsed { id, entry }).ok();
        self.event_tx
            .send(Event::ListingProgress { id, summary })
            .ok();
    }

    /// Byte-sink stage stdout
    pub(crate) fn sink_chunk(&mut self, id: ArchiveId, chunk: &[u8]) {
        if let Some(pipeline) = self.pipeline_mut(id) {
            pipeline.write_sink(chunk);
        }
    }

    /// Any stage's stderr
    pub(crate) fn diagnostic_line(&mut self, id: ArchiveId, line: &str) {
        debug!(archive_id = id.0, line, "tool stderr");
        if let Some(pipeline) = self.pipeline_mut(id) {
            pipeline.push_diagnostic(line);
        }
    }

    /// Verbose output nobody parses
    pub(crate) fn output_line(&mut self, id: ArchiveId, line: &str) {
        debug!(archive_id = id.0, line, "tool output");
    }

    /// A stage stream ended; listing streams also close the parser
    pub(crate) fn stream_closed(&mut self, id: ArchiveId, feeds_listing: bool, end: StreamEnd) {
        let Some(handle) = self.handles.get_mut(&id) else {
            return;
        };
        if feeds_listing {
            let summary = handle.listing_mut().on_complete();
            debug!(
                archive_id = id.0,
                files = summary.files,
                dirs = summary.dirs,
                total_size = summary.total_size,
                "listing stream ended"
            );
        }
        if let StreamEnd::Error(e) = &end {
            tracing::warn!(archive_id = id.0, error = %e, "tool output stream failed");
        }
        if let Some(pipeline) = handle.pipeline.as_mut() {
            pipeline.stream_closed(end);
        }
    }
}

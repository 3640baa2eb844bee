//! Archive handles

use std::path::{Path, PathBuf};

use crate::error::StageFailure;
use crate::formats::rpm::PayloadLayout;
use crate::listing::{EntryTable, ListingFormat, ListingParser};
use crate::pipeline::Pipeline;
use crate::types::{
    ArchiveId, ArchiveKind, Entry, ListingStatus, ListingSummary, Outcome, PipelineState,
};

/// One open archive, owned by the [`ArchiveManager`](crate::ArchiveManager)
#[derive(Debug)]
pub struct ArchiveHandle {
    id: ArchiveId,
    path: PathBuf,
    kind: ArchiveKind,
    listing: ListingParser,
    listing_status: ListingStatus,
    staging_dir: Option<PathBuf>,
    payload: Option<PayloadLayout>,
    pub(crate) pipeline: Option<Pipeline>,
    outcome: Option<Outcome>,
}

impl ArchiveHandle {
    pub(crate) fn new(id: ArchiveId, path: PathBuf, kind: ArchiveKind) -> Self {
        let format = match kind {
            ArchiveKind::Rpm => ListingFormat::Cpio,
            ArchiveKind::Tar | ArchiveKind::Other => ListingFormat::Tar,
        };
        Self {
            id,
            path,
            kind,
            listing: ListingParser::new(format),
            listing_status: ListingStatus::Empty,
            staging_dir: None,
            payload: None,
            pipeline: None,
            outcome: None,
        }
    }

    /// Handle ID
    pub fn id(&self) -> ArchiveId {
        self.id
    }

    /// Absolute archive path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive kind
    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Entries from the latest listing, possibly partial
    ///
    /// Check [`listing_status`](Self::listing_status) before treating these as
    /// the full contents.
    pub fn entries(&self) -> &[Entry] {
        self.listing.table().entries()
    }

    /// Entry table with its counters
    pub fn table(&self) -> &EntryTable {
        self.listing.table()
    }

    /// Aggregates of the latest listing
    pub fn summary(&self) -> ListingSummary {
        self.listing.table().summary()
    }

    /// Whether the entry table is complete
    pub fn listing_status(&self) -> ListingStatus {
        self.listing_status
    }

    /// State of the current (or last) pipeline
    pub fn state(&self) -> PipelineState {
        self.pipeline
            .as_ref()
            .map(Pipeline::state)
            .unwrap_or_default()
    }

    /// Returns `true` while a pipeline is live
    pub fn is_busy(&self) -> bool {
        self.pipeline.as_ref().is_some_and(|p| !p.is_terminal())
    }

    /// Result of the last finished pipeline
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Failure of the last pipeline, if it failed
    pub fn last_failure(&self) -> Option<&StageFailure> {
        self.outcome.as_ref().and_then(Outcome::failure)
    }

    /// Staging directory, once one was prepared
    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging_dir.as_deref()
    }

    pub(crate) fn set_staging_dir(&mut self, dir: PathBuf) {
        self.staging_dir = Some(dir);
    }

    pub(crate) fn payload(&self) -> Option<PayloadLayout> {
        self.payload
    }

    pub(crate) fn set_payload(&mut self, layout: PayloadLayout) {
        self.payload = Some(layout);
    }

    /// Install a new pipeline, forgetting the previous outcome
    pub(crate) fn start_pipeline(&mut self, pipeline: Pipeline) {
        self.outcome = None;
        self.pipeline = Some(pipeline);
    }

    pub(crate) fn finish(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }

    /// Start a fresh listing in `format`
    pub(crate) fn begin_listing(&mut self, format: ListingFormat) {
        self.listing = ListingParser::new(format);
        self.listing_status = ListingStatus::InProgress;
    }

    pub(crate) fn listing_mut(&mut self) -> &mut ListingParser {
        &mut self.listing
    }

    /// Close the listing; partial tables are marked incomplete
    pub(crate) fn end_listing(&mut self, complete: bool) {
        if self.listing_status == ListingStatus::InProgress {
            self.listing_status = if complete {
                ListingStatus::Complete
            } else {
                ListingStatus::Incomplete
            };
        }
    }

    /// Drop partial listing state after cancellation
    pub(crate) fn discard_listing(&mut self) {
        self.listing = ListingParser::new(self.listing.format());
        self.listing_status = ListingStatus::Empty;
    }
}

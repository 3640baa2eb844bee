//! Listing parser for verbose tool output
//!
//! Turns `tar -tv` and `cpio -tv` lines into [`Entry`] records and keeps the
//! running counters the GUI shows while a listing streams in.
//!
//! ## Invariants
//!
//! - Every non-blank line yields exactly one entry, malformed or not
//! - `file_count + dir_count == entries.len()`
//! - `total_size == sum(entry.size)`
//!
//! The parser never fails. Whether a partial table may be presented as
//! complete is decided by the pipeline, not here.

mod cpio;
mod tar;

pub use cpio::parse_cpio_line;
pub use tar::parse_tar_line;

use serde::{Deserialize, Serialize};

use crate::split::SplitMode;
use crate::types::{Entry, ListingSummary};

/// Which tool produced the listing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingFormat {
    /// `tar -tv`
    Tar,
    /// `cpio -tv`
    Cpio,
}

impl ListingFormat {
    /// Splitter layout for this format
    pub fn split_mode(self) -> SplitMode {
        match self {
            ListingFormat::Tar => SplitMode::Delimited {
                fields: crate::split::TAR_FIELDS,
            },
            ListingFormat::Cpio => SplitMode::FixedColumn,
        }
    }

    /// Parse one line in this format
    pub fn parse_line(self, line: &str) -> ParsedLine {
        match self {
            ListingFormat::Tar => parse_tar_line(line),
            ListingFormat::Cpio => parse_cpio_line(line),
        }
    }
}

/// An entry plus whether its line fit the expected layout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedLine {
    /// The (possibly best-effort) entry
    pub entry: Entry,
    /// The line did not fit the layout
    pub malformed: bool,
}

/// Ordered entries with aggregate counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryTable {
    entries: Vec<Entry>,
    files: u64,
    dirs: u64,
    total_size: u64,
}

impl EntryTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and bump exactly one counter
    pub fn push(&mut self, entry: Entry) -> &Entry {
        if entry.is_dir {
            self.dirs += 1;
        } else {
            self.files += 1;
        }
        self.total_size = self.total_size.saturating_add(entry.size);
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Entries in listing order
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was listed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Non-directory entries
    pub fn file_count(&self) -> u64 {
        self.files
    }

    /// Directory entries
    pub fn dir_count(&self) -> u64 {
        self.dirs
    }

    /// Sum of entry sizes
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Current aggregates
    pub fn summary(&self) -> ListingSummary {
        ListingSummary {
            files: self.files,
            dirs: self.dirs,
            total_size: self.total_size,
        }
    }

    /// Look up an entry by exact name
    pub fn find(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Drop every entry and reset the counters
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Incremental parser feeding an [`EntryTable`]
#[derive(Clone, Debug)]
pub struct ListingParser {
    format: ListingFormat,
    table: EntryTable,
    malformed: u64,
    complete: bool,
}

impl ListingParser {
    /// Parser for `format` with an empty table
    pub fn new(format: ListingFormat) -> Self {
        Self {
            format,
            table: EntryTable::new(),
            malformed: 0,
            complete: false,
        }
    }

    /// Active format
    pub fn format(&self) -> ListingFormat {
        self.format
    }

    /// Parse one line and append the resulting entry
    ///
    /// Returns `None` for blank lines and for lines arriving after
    /// [`on_complete`](Self::on_complete).
    pub fn on_line(&mut self, line: &str) -> Option<&Entry> {
        if self.complete || line.trim().is_empty() {
            return None;
        }

        let parsed = self.format.parse_line(line);
        if parsed.malformed {
            self.malformed += 1;
            tracing::debug!(format = ?self.format, line, "malformed listing line");
        }
        Some(self.table.push(parsed.entry))
    }

    /// Close the listing and report the aggregates
    pub fn on_complete(&mut self) -> ListingSummary {
        self.complete = true;
        self.table.summary()
    }

    /// Returns `true` once end-of-stream was seen
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Lines that did not fit the layout
    pub fn malformed_lines(&self) -> u64 {
        self.malformed
    }

    /// Entries so far
    pub fn table(&self) -> &EntryTable {
        &self.table
    }

    /// Give up the table
    pub fn into_table(self) -> EntryTable {
        self.table
    }
}

/// Build an entry for a line that did not fit its layout
pub(crate) fn best_effort_entry(remainder: String) -> Entry {
    let is_dir = crate::split::is_directory(None, &remainder);
    Entry {
        name: remainder,
        is_dir,
        ..Default::default()
    }
}

/// Directories are named with a trailing separator
pub(crate) fn normalize_dir_name(mut name: String, is_dir: bool) -> String {
    if is_dir && !name.ends_with('/') {
        name.push('/');
    }
    name
}

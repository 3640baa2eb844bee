//! # arcpipe
//!
//! Archive-manager backend that drives external command-line tools (tar,
//! cpio, dd, gzip/bzip2/xz/zstd) to list, extract, add and remove archive
//! entries.
//!
//! ## Design Philosophy
//!
//! arcpipe is designed to be:
//! - **Tool-driven** - No in-process archive decoders; every format operation is an external process
//! - **Pipelined** - Multi-stage operations (cut payload, decompress, list) run stage by stage, aborting on the first failure
//! - **Streaming** - Listings are parsed line by line while the tool runs, with running totals
//! - **Event-driven** - Consumers subscribe to events instead of polling
//! - **Shell-free** - Commands are argument tokens, never shell strings
//!
//! ## Quick Start
//!
//! ```no_run
//! use arcpipe::{ArchiveManager, Config, Event};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut manager = ArchiveManager::new(Config::default())?;
//!
//!     // Subscribe before opening so no progress event is missed
//!     let mut events = manager.subscribe();
//!
//!     let id = manager.open("package.rpm").await?;
//!     let outcome = manager.wait(id).await?;
//!
//!     while let Ok(event) = events.try_recv() {
//!         if let Event::ListingProgress { summary, .. } = event {
//!             println!("{} files, {} bytes", summary.files, summary.total_size);
//!         }
//!     }
//!
//!     match outcome.failure() {
//!         None => println!("listed {} entries", manager.handle(id).map_or(0, |h| h.entries().len())),
//!         Some(failure) => eprintln!("{failure}: {}", failure.diagnostic),
//!     }
//!
//!     manager.close(id).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Archive handles
pub mod archive;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Archive kind detection and per-format command plans
pub mod formats;
/// Listing parsers and the entry table
pub mod listing;
/// Archive manager (handles, operations, reactor driving)
pub mod manager;
/// Multi-stage pipeline state machine
pub mod pipeline;
/// External process spawning
pub mod process;
/// Output reactor multiplexing process streams
pub mod reactor;
/// Line field splitting helpers
pub mod split;
/// Staging (temp directory) provider
pub mod staging;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use archive::ArchiveHandle;
pub use config::{Config, ReactorConfig, StagingConfig, Tool, ToolsConfig};
pub use error::{
    Error, ErrorDetail, FailureReason, HeaderLayoutError, Result, SpawnError, StageFailure,
};
pub use listing::{EntryTable, ListingFormat, ListingParser};
pub use manager::ArchiveManager;
pub use pipeline::{Completion, PipelineStage, StageRole};
pub use process::CommandSpec;
pub use staging::{DirStaging, StagingArea};
pub use types::{
    ArchiveId, ArchiveKind, Entry, Event, ExitStatus, ListingStatus, ListingSummary, Outcome,
    PipelineState, Stage,
};

//! Archive formats: detection and per-format command plans
//!
//! Each format module turns an operation (list, extract, add, remove) into
//! the [`PipelineStage`](crate::pipeline::PipelineStage)s that carry it out.

pub mod rpm;
pub mod tar;

use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::Result;
use crate::types::ArchiveKind;

/// Bytes inspected by [`detect_kind`]
const PROBE_LEN: usize = 512;

/// Offset of the `ustar` magic in a tar header
const USTAR_OFFSET: usize = 257;

const TAR_SUFFIXES: &[&str] = &[
    ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz", ".tbz2", ".tar.xz", ".txz", ".tar.zst",
    ".tzst",
];

/// Classify an archive from its name and first bytes
///
/// The RPM lead magic and the `ustar` header magic are decisive. Compressed
/// tarballs cannot be recognised from their bytes alone, so the file name
/// decides for those; GNU tar detects the compression itself.
pub fn classify(file_name: &str, head: &[u8]) -> ArchiveKind {
    if head.starts_with(&rpm::LEAD_MAGIC) {
        return ArchiveKind::Rpm;
    }
    if head.get(USTAR_OFFSET..USTAR_OFFSET + 5) == Some(b"ustar".as_slice()) {
        return ArchiveKind::Tar;
    }

    let lower = file_name.to_ascii_lowercase();
    if TAR_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
        return ArchiveKind::Tar;
    }
    if lower.ends_with(".rpm") {
        // Header validation reports the bad lead later
        return ArchiveKind::Rpm;
    }
    ArchiveKind::Other
}

/// Read the start of `path` and classify it
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn detect_kind(path: &Path) -> Result<ArchiveKind> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(PROBE_LEN);
    (&mut file).take(PROBE_LEN as u64).read_to_end(&mut head).await?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(classify(&name, &head))
}

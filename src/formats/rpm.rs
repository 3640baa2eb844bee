//! RPM packages: header layout and command plans
//!
//! An RPM is a 96-byte lead, a signature header, the main header and then a
//! compressed cpio payload. Both headers share one layout: 8 bytes of magic
//! and reserved space, two big-endian `u32` lengths (index entries `il` and
//! data bytes `dl`), `16 * il` bytes of index and `dl` bytes of data. The
//! signature header is padded to an 8-byte boundary.
//!
//! ```text
//! 0      96       104                        104+sig+pad   +8         payload
//! | lead | magic  | il dl | index | data | pad | magic | il dl | ... |
//! ```
//!
//! Opening a package cuts the payload out with `dd`, decompresses it into the
//! staging area and lists the staged cpio archive.

use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::config::{Tool, ToolsConfig};
use crate::error::{Error, HeaderLayoutError, Result};
use crate::listing::ListingFormat;
use crate::pipeline::{PipelineStage, StageRole};
use crate::process::CommandSpec;
use crate::types::Stage;

/// First four bytes of every RPM
pub const LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];

/// Where the signature header's lengths live
pub const LENGTHS_OFFSET: u64 = 104;

/// Staged copy of the compressed payload
pub const PAYLOAD_FILE: &str = "payload.z";

/// Staged decompressed cpio archive
pub const CPIO_FILE: &str = "payload.cpio";

/// Magic + reserved bytes that precede a header's lengths
const HEADER_PREAMBLE: u64 = 8;

/// Longest compression magic we compare against
const MAGIC_PROBE: usize = 6;

/// The two length fields of one header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderLengths {
    /// Index entry count (`il`)
    pub index_entries: u32,
    /// Data section size in bytes (`dl`)
    pub data_len: u32,
}

impl HeaderLengths {
    /// Decode `il` and `dl` from eight big-endian bytes
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self {
            index_entries: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data_len: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// `8 + 16 * il + dl`: the lengths, index and data of the header
    pub fn section_size(self) -> u64 {
        8 + 16 * u64::from(self.index_entries) + u64::from(self.data_len)
    }
}

/// Offset of the main header's lengths
pub fn second_lengths_offset(signature: HeaderLengths) -> u64 {
    let sig = signature.section_size();
    let pad = (8 - sig % 8) % 8;
    LENGTHS_OFFSET + sig + pad + HEADER_PREAMBLE
}

/// Offset of the compressed payload
///
/// Pure: the same lengths always give the same offset.
pub fn payload_offset(signature: HeaderLengths, header: HeaderLengths) -> u64 {
    second_lengths_offset(signature) + header.section_size()
}

/// Payload compressor, identified by magic bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    /// `1f 8b`
    Gzip,
    /// `BZh`
    Bzip2,
    /// `fd 37 7a 58 5a 00`
    Xz,
    /// `28 b5 2f fd`
    Zstd,
}

impl Compression {
    /// Recognise a compressor from the first payload bytes
    pub fn detect(head: &[u8]) -> Option<Self> {
        if head.starts_with(&[0x1f, 0x8b]) {
            Some(Compression::Gzip)
        } else if head.starts_with(b"BZh") {
            Some(Compression::Bzip2)
        } else if head.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Some(Compression::Xz)
        } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Some(Compression::Zstd)
        } else {
            None
        }
    }

    /// Tool that decompresses this format
    pub fn tool(self) -> Tool {
        match self {
            Compression::Gzip => Tool::Gzip,
            Compression::Bzip2 => Tool::Bzip2,
            Compression::Xz => Tool::Xz,
            Compression::Zstd => Tool::Zstd,
        }
    }
}

/// Where the payload starts and how it is compressed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadLayout {
    /// Byte offset of the payload
    pub offset: u64,
    /// Payload compressor
    pub compression: Compression,
}

/// Read the header lengths of `path` and locate its payload
///
/// # Errors
///
/// - [`HeaderLayoutError::BadMagic`] if the lead magic is missing
/// - [`HeaderLayoutError::Truncated`] if the file ends inside a header
/// - [`HeaderLayoutError::OffsetBeyondEnd`] if the payload would start past the end
/// - [`HeaderLayoutError::UnknownPayload`] if no known compressor matches
/// - [`Error::Io`] if the file cannot be read
pub async fn read_payload_layout(path: &Path) -> Result<PayloadLayout> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let mut lead = [0u8; 4];
    match read_at(&mut file, 0, &mut lead).await {
        Ok(()) if lead == LEAD_MAGIC => {}
        Ok(()) => return Err(HeaderLayoutError::BadMagic.into()),
        Err(Error::HeaderLayout(HeaderLayoutError::Truncated { .. })) => {
            return Err(HeaderLayoutError::BadMagic.into());
        }
        Err(e) => return Err(e),
    }

    let mut lengths = [0u8; 8];
    read_at(&mut file, LENGTHS_OFFSET, &mut lengths).await?;
    let signature = HeaderLengths::from_be_bytes(lengths);

    read_at(&mut file, second_lengths_offset(signature), &mut lengths).await?;
    let header = HeaderLengths::from_be_bytes(lengths);

    let offset = payload_offset(signature, header);
    if offset >= len {
        return Err(HeaderLayoutError::OffsetBeyondEnd { offset, len }.into());
    }

    let available = usize::try_from(len - offset).unwrap_or(MAGIC_PROBE).min(MAGIC_PROBE);
    let mut head = vec![0u8; available];
    read_at(&mut file, offset, &mut head).await?;

    let compression =
        Compression::detect(&head).ok_or(HeaderLayoutError::UnknownPayload { offset })?;

    tracing::debug!(path = %path.display(), offset, ?compression, "located rpm payload");
    Ok(PayloadLayout {
        offset,
        compression,
    })
}

async fn read_at(file: &mut tokio::fs::File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    match file.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(HeaderLayoutError::Truncated {
                offset,
                needed: buf.len(),
            }
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

fn key_value(key: &str, value: impl AsRef<std::ffi::OsStr>) -> OsString {
    let mut arg = OsString::from(key);
    arg.push("=");
    arg.push(value);
    arg
}

/// Staged compressed payload for `staging`
pub fn payload_path(staging: &Path) -> PathBuf {
    staging.join(PAYLOAD_FILE)
}

/// Staged cpio archive for `staging`
pub fn cpio_path(staging: &Path) -> PathBuf {
    staging.join(CPIO_FILE)
}

/// Cut the payload out and decompress it into the staging area
pub fn payload_plan(
    tools: &ToolsConfig,
    archive: &Path,
    layout: PayloadLayout,
    staging: &Path,
) -> Vec<PipelineStage> {
    let cut = CommandSpec::new(tools.resolve(Tool::Dd))
        .arg(key_value("if", archive))
        .arg(key_value("ibs", layout.offset.to_string()))
        .arg("skip=1")
        .arg(key_value("of", payload_path(staging)));

    let decompress = CommandSpec::new(tools.resolve(layout.compression.tool()))
        .arg("-dc")
        .arg(payload_path(staging));

    vec![
        PipelineStage::new(Stage::ExtractPayload, cut, StageRole::Log),
        PipelineStage::new(
            Stage::Decompress,
            decompress,
            StageRole::ByteSink {
                path: cpio_path(staging),
            },
        ),
    ]
}

/// `cpio -tv --file <staging>/payload.cpio` feeding the cpio listing parser
pub fn list_stage(tools: &ToolsConfig, staging: &Path) -> PipelineStage {
    PipelineStage::new(
        Stage::ListInner,
        CommandSpec::new(tools.resolve(Tool::Cpio))
            .arg("-tv")
            .arg("--file")
            .arg(cpio_path(staging)),
        StageRole::Listing(ListingFormat::Cpio),
    )
}

/// Full open pipeline: cut, decompress, list
pub fn open_plan(
    tools: &ToolsConfig,
    archive: &Path,
    layout: PayloadLayout,
    staging: &Path,
) -> Vec<PipelineStage> {
    let mut plan = payload_plan(tools, archive, layout, staging);
    plan.push(list_stage(tools, staging));
    plan
}

/// Extract `names` (everything when empty) into `destination`
///
/// cpio runs inside `destination`. The payload stages are re-run first when
/// the staged cpio archive is gone.
pub fn extract_plan(
    tools: &ToolsConfig,
    archive: &Path,
    layout: PayloadLayout,
    staging: &Path,
    names: &[String],
    destination: &Path,
) -> Vec<PipelineStage> {
    let mut plan = if cpio_path(staging).is_file() {
        Vec::new()
    } else {
        payload_plan(tools, archive, layout, staging)
    };

    // cpio stores directories without the trailing separator
    let patterns = names
        .iter()
        .map(|name| OsString::from(name.trim_end_matches('/')));
    let command = CommandSpec::new(tools.resolve(Tool::Cpio))
        .arg("-id")
        .args(patterns)
        .arg("-F")
        .arg(cpio_path(staging))
        .current_dir(destination);

    plan.push(PipelineStage::new(Stage::Extract, command, StageRole::Log));
    plan
}

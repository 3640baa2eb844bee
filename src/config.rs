//! Configuration types for arcpipe

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// External tools driven by the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    /// GNU tar
    Tar,
    /// GNU cpio
    Cpio,
    /// dd, used to cut payloads out at a byte offset
    Dd,
    /// gzip
    Gzip,
    /// bzip2
    Bzip2,
    /// xz
    Xz,
    /// zstd
    Zstd,
}

impl Tool {
    /// Program name looked up on PATH
    pub fn program_name(self) -> &'static str {
        match self {
            Tool::Tar => "tar",
            Tool::Cpio => "cpio",
            Tool::Dd => "dd",
            Tool::Gzip => "gzip",
            Tool::Bzip2 => "bzip2",
            Tool::Xz => "xz",
            Tool::Zstd => "zstd",
        }
    }
}

/// External tool paths
///
/// Groups settings for locating external binaries.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to tar executable (auto-detected if None)
    #[serde(default)]
    pub tar_path: Option<PathBuf>,

    /// Path to cpio executable (auto-detected if None)
    #[serde(default)]
    pub cpio_path: Option<PathBuf>,

    /// Path to dd executable (auto-detected if None)
    #[serde(default)]
    pub dd_path: Option<PathBuf>,

    /// Path to gzip executable (auto-detected if None)
    #[serde(default)]
    pub gzip_path: Option<PathBuf>,

    /// Path to bzip2 executable (auto-detected if None)
    #[serde(default)]
    pub bzip2_path: Option<PathBuf>,

    /// Path to xz executable (auto-detected if None)
    #[serde(default)]
    pub xz_path: Option<PathBuf>,

    /// Path to zstd executable (auto-detected if None)
    #[serde(default)]
    pub zstd_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tar_path: None,
            cpio_path: None,
            dd_path: None,
            gzip_path: None,
            bzip2_path: None,
            xz_path: None,
            zstd_path: None,
            search_path: true,
        }
    }
}

impl ToolsConfig {
    /// Explicitly configured path for a tool
    pub fn configured_path(&self, tool: Tool) -> Option<&PathBuf> {
        match tool {
            Tool::Tar => self.tar_path.as_ref(),
            Tool::Cpio => self.cpio_path.as_ref(),
            Tool::Dd => self.dd_path.as_ref(),
            Tool::Gzip => self.gzip_path.as_ref(),
            Tool::Bzip2 => self.bzip2_path.as_ref(),
            Tool::Xz => self.xz_path.as_ref(),
            Tool::Zstd => self.zstd_path.as_ref(),
        }
    }

    /// Resolve the program token for a tool
    ///
    /// Order: explicit path, then PATH lookup via `which` (when `search_path`
    /// is set), then the bare program name. A program that cannot be found is
    /// reported when the stage spawns, not here.
    pub fn resolve(&self, tool: Tool) -> PathBuf {
        if let Some(path) = self.configured_path(tool) {
            return path.clone();
        }
        if self.search_path
            && let Ok(path) = which::which(tool.program_name())
        {
            return path;
        }
        PathBuf::from(tool.program_name())
    }
}

/// Staging area settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Root under which per-archive staging directories are created
    /// (default: `<system temp>/arcpipe`)
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
        }
    }
}

/// Output reactor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReactorConfig {
    /// Largest chunk read from a byte-sink stream per dispatch (default: 64 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Error-stream bytes retained per stage for diagnostics (default: 16 KiB)
    #[serde(default = "default_max_diagnostic_bytes")]
    pub max_diagnostic_bytes: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_diagnostic_bytes: default_max_diagnostic_bytes(),
        }
    }
}

/// Main configuration for ArchiveManager
///
/// Sub-configs are flattened for serialization, so the JSON/TOML form is a
/// single flat table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// External tool paths
    #[serde(flatten)]
    pub tools: ToolsConfig,

    /// Staging area
    #[serde(flatten)]
    pub staging: StagingConfig,

    /// Output reactor
    #[serde(flatten)]
    pub reactor: ReactorConfig,

    /// Capacity of the event broadcast channel (default: 1024)
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tools: ToolsConfig::default(),
            staging: StagingConfig::default(),
            reactor: ReactorConfig::default(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Staging root directory
    pub fn staging_dir(&self) -> &PathBuf {
        &self.staging.staging_dir
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("chunk_size", self.reactor.chunk_size),
            ("max_diagnostic_bytes", self.reactor.max_diagnostic_bytes),
            ("event_channel_capacity", self.event_channel_capacity),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(Error::Config {
                    message: format!("{} must be greater than zero", key),
                    key: Some(key.to_string()),
                });
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("arcpipe")
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_max_diagnostic_bytes() -> usize {
    16 * 1024
}

fn default_event_capacity() -> usize {
    1024
}

//! Staging area for intermediate pipeline files

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::ArchiveId;

/// Provider of per-archive scratch directories
///
/// Composite archives are unpacked in steps: the cut payload and the
/// decompressed inner archive live here between stages, and later stages
/// read them by name. Implementations decide where that space comes from.
///
/// # Examples
///
/// ```no_run
/// use arcpipe::staging::{DirStaging, StagingArea};
/// use arcpipe::ArchiveId;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let staging = DirStaging::new("/var/tmp/arcpipe");
/// let dir = staging.prepare(ArchiveId(1)).await?;
/// println!("staging into {}", dir.display());
/// staging.release(ArchiveId(1)).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait StagingArea: Send + Sync {
    /// Create (or reuse) the scratch directory for `id`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    async fn prepare(&self, id: ArchiveId) -> Result<PathBuf>;

    /// Remove the scratch directory for `id` and everything in it
    ///
    /// Releasing a directory that was never prepared is not an error.
    async fn release(&self, id: ArchiveId) -> Result<()>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Staging under a root directory, one subdirectory per archive
#[derive(Clone, Debug)]
pub struct DirStaging {
    root: PathBuf,
}

impl DirStaging {
    /// Stage under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory used for `id`
    pub fn dir_for(&self, id: ArchiveId) -> PathBuf {
        self.root.join(format!("archive-{}", id))
    }
}

#[async_trait]
impl StagingArea for DirStaging {
    async fn prepare(&self, id: ArchiveId) -> Result<PathBuf> {
        let dir = self.dir_for(id);
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(archive_id = id.0, dir = %dir.display(), "prepared staging directory");
        Ok(dir)
    }

    async fn release(&self, id: ArchiveId) -> Result<()> {
        let dir = self.dir_for(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(archive_id = id.0, dir = %dir.display(), "released staging directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "dir"
    }
}

//! Operations on open archives: extract, add, remove, reload, custom stages

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::formats::{rpm, tar};
use crate::pipeline::PipelineStage;
use crate::types::{ArchiveId, ArchiveKind};

use super::ArchiveManager;

impl ArchiveManager {
    fn kind_and_path(&self, id: ArchiveId) -> Result<(ArchiveKind, PathBuf)> {
        let handle = self.session.handles.get(&id).ok_or(Error::NotFound(id))?;
        if handle.is_busy() {
            return Err(Error::Busy(id));
        }
        Ok((handle.kind(), handle.path().to_path_buf()))
    }

    /// Extract entries into `destination`
    ///
    /// An empty `names` list extracts everything. With `flatten`, tar strips
    /// the leading directories the requested names share; flatten is ignored
    /// for RPM packages. The destination is created if missing.
    ///
    /// # Arguments
    ///
    /// * `id` - The archive to extract from
    /// * `names` - Entry names as listed
    /// * `destination` - Target directory
    /// * `flatten` - Drop shared leading directories (tar only)
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] / [`Error::Busy`] for a missing or busy handle
    /// - [`Error::Io`] if the destination cannot be created
    /// - [`Error::NotSupported`] for archives this backend cannot drive
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use arcpipe::*;
    /// # async fn example(manager: &mut ArchiveManager, id: ArchiveId) -> Result<()> {
    /// manager
    ///     .extract(id, &["docs/guide.md".to_string()], "/tmp/out", true)
    ///     .await?;
    /// let outcome = manager.wait(id).await?;
    /// assert!(outcome.is_success());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn extract(
        &mut self,
        id: ArchiveId,
        names: &[String],
        destination: impl AsRef<Path>,
        flatten: bool,
    ) -> Result<()> {
        let (kind, archive) = self.kind_and_path(id)?;
        let destination = std::path::absolute(destination.as_ref())?;
        tokio::fs::create_dir_all(&destination).await?;

        let stages = match kind {
            ArchiveKind::Tar => {
                tar::extract_plan(&self.config.tools, &archive, names, &destination, flatten)
            }
            ArchiveKind::Rpm => {
                if flatten {
                    warn!(archive_id = id.0, "flatten is not supported for rpm packages, ignoring");
                }
                let (staging, layout) = self.rpm_staging(id).await?;
                rpm::extract_plan(
                    &self.config.tools,
                    &archive,
                    layout,
                    &staging,
                    names,
                    &destination,
                )
            }
            ArchiveKind::Other => return Err(unsupported(&archive)),
        };

        info!(
            archive_id = id.0,
            entries = names.len(),
            destination = %destination.display(),
            flatten,
            "extracting"
        );
        self.start(id, stages)
    }

    /// Add files and directories to a tar archive, then re-list it
    ///
    /// The archive is created if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] for RPM packages or an empty path list.
    pub async fn add(&mut self, id: ArchiveId, paths: &[PathBuf]) -> Result<()> {
        let (kind, archive) = self.kind_and_path(id)?;
        if kind != ArchiveKind::Tar {
            return Err(Error::NotSupported(
                "adding files is only supported for tar archives".to_string(),
            ));
        }
        if paths.is_empty() {
            return Err(Error::NotSupported("add needs at least one path".to_string()));
        }

        let paths = paths
            .iter()
            .map(std::path::absolute)
            .collect::<std::io::Result<Vec<_>>>()?;
        let exists = tokio::fs::try_exists(&archive).await?;

        info!(archive_id = id.0, files = paths.len(), create = !exists, "adding to archive");
        let stages = tar::add_plan(&self.config.tools, &archive, &paths, exists);
        self.start(id, stages)
    }

    /// Delete entries from a tar archive, then re-list it
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] for RPM packages.
    pub fn remove(&mut self, id: ArchiveId, names: &[String]) -> Result<()> {
        let (kind, archive) = self.kind_and_path(id)?;
        if kind != ArchiveKind::Tar {
            return Err(Error::NotSupported(
                "removing entries is only supported for tar archives".to_string(),
            ));
        }

        info!(archive_id = id.0, entries = names.len(), "removing from archive");
        let stages = tar::remove_plan(&self.config.tools, &archive, names);
        self.start(id, stages)
    }

    /// List the archive again
    ///
    /// RPM packages are re-staged from the package file.
    pub async fn reload(&mut self, id: ArchiveId) -> Result<()> {
        let (kind, archive) = self.kind_and_path(id)?;
        let stages = match kind {
            ArchiveKind::Tar => tar::list_plan(&self.config.tools, &archive),
            ArchiveKind::Rpm => {
                let layout = rpm::read_payload_layout(&archive).await?;
                let staging = self.staging.prepare(id).await?;
                if let Some(handle) = self.session.handles.get_mut(&id) {
                    handle.set_payload(layout);
                    handle.set_staging_dir(staging.clone());
                }
                rpm::open_plan(&self.config.tools, &archive, layout, &staging)
            }
            ArchiveKind::Other => return Err(unsupported(&archive)),
        };

        info!(archive_id = id.0, "reloading archive");
        self.start(id, stages)
    }

    /// Run a caller-built stage list on a handle
    ///
    /// Stages run in order with the same abort rules as built-in operations.
    pub fn submit(&mut self, id: ArchiveId, stages: Vec<PipelineStage>) -> Result<()> {
        self.kind_and_path(id)?;
        info!(archive_id = id.0, stages = stages.len(), "submitting custom pipeline");
        self.start(id, stages)
    }

    /// Staging directory and payload layout of an RPM handle
    async fn rpm_staging(&mut self, id: ArchiveId) -> Result<(PathBuf, rpm::PayloadLayout)> {
        let handle = self.session.handles.get(&id).ok_or(Error::NotFound(id))?;
        let layout = match handle.payload() {
            Some(layout) => layout,
            None => rpm::read_payload_layout(handle.path()).await?,
        };
        // Recreating is a no-op when the directory is still there
        let staging = self.staging.prepare(id).await?;

        if let Some(handle) = self.session.handles.get_mut(&id) {
            handle.set_payload(layout);
            handle.set_staging_dir(staging.clone());
        }
        Ok((staging, layout))
    }
}

fn unsupported(path: &Path) -> Error {
    Error::NotSupported(format!(
        "{} is not a tar archive or rpm package",
        path.display()
    ))
}

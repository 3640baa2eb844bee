//! tar command plans
//!
//! GNU tar handles every operation natively, including compressed archives,
//! so each operation is one stage. Add and remove are followed by a fresh
//! listing stage so the entry table reflects the rewritten archive.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::{Tool, ToolsConfig};
use crate::listing::ListingFormat;
use crate::pipeline::{PipelineStage, StageRole};
use crate::process::CommandSpec;
use crate::types::Stage;

fn tar(tools: &ToolsConfig) -> CommandSpec {
    CommandSpec::new(tools.resolve(Tool::Tar))
}

/// `tar -tvf <archive>` feeding the tar listing parser
pub fn list_stage(tools: &ToolsConfig, archive: &Path) -> PipelineStage {
    PipelineStage::new(
        Stage::ListInner,
        tar(tools).arg("-tvf").arg(archive),
        StageRole::Listing(ListingFormat::Tar),
    )
}

/// Plan for listing
pub fn list_plan(tools: &ToolsConfig, archive: &Path) -> Vec<PipelineStage> {
    vec![list_stage(tools, archive)]
}

/// Leading components every requested name can lose
///
/// This is the smallest parent depth among `names`, so that flattening
/// never strips a requested entry itself. No names means no stripping.
pub fn strip_components(names: &[String]) -> usize {
    names
        .iter()
        .map(|name| {
            name.split('/')
                .filter(|c| !c.is_empty())
                .count()
                .saturating_sub(1)
        })
        .min()
        .unwrap_or(0)
}

/// Plan for extracting `names` (everything when empty) into `destination`
pub fn extract_plan(
    tools: &ToolsConfig,
    archive: &Path,
    names: &[String],
    destination: &Path,
    flatten: bool,
) -> Vec<PipelineStage> {
    let mut command = tar(tools);
    if flatten {
        let strip = strip_components(names);
        if strip > 0 {
            command = command.arg(format!("--strip-components={}", strip));
        }
    }
    let command = command
        .arg("-xvf")
        .arg(archive)
        .arg("-C")
        .arg(destination)
        .args(names.iter().map(OsString::from));

    vec![PipelineStage::new(Stage::Extract, command, StageRole::Log)]
}

/// Plan for adding `paths`, creating the archive when it does not exist
///
/// A new archive is compressed according to its suffix (`--auto-compress`).
/// tar runs in the parent directory of the first path and receives names
/// relative to it where possible, so entries are stored without the
/// caller's directory prefix.
pub fn add_plan(
    tools: &ToolsConfig,
    archive: &Path,
    paths: &[PathBuf],
    archive_exists: bool,
) -> Vec<PipelineStage> {
    let working_dir = paths
        .first()
        .and_then(|first| first.parent())
        .filter(|parent| !parent.as_os_str().is_empty());

    let names = paths.iter().map(|path| match working_dir {
        Some(dir) => match path.strip_prefix(dir) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.as_os_str().to_owned(),
            _ => path.as_os_str().to_owned(),
        },
        None => path.as_os_str().to_owned(),
    });

    // Appending cannot recompress, so only creation picks a compressor
    let mut command = if archive_exists {
        tar(tools).arg("-rvvf")
    } else {
        tar(tools).arg("--auto-compress").arg("-cvvf")
    };
    command = command.arg(archive).args(names);
    if let Some(dir) = working_dir {
        command = command.current_dir(dir);
    }

    vec![
        PipelineStage::new(Stage::Add, command, StageRole::Log),
        list_stage(tools, archive),
    ]
}

/// Plan for deleting `names` from the archive
pub fn remove_plan(tools: &ToolsConfig, archive: &Path, names: &[String]) -> Vec<PipelineStage> {
    let command = tar(tools)
        .arg("--delete")
        .arg("-vf")
        .arg(archive)
        .args(names.iter().map(OsString::from));

    vec![
        PipelineStage::new(Stage::Remove, command, StageRole::Log),
        list_stage(tools, archive),
    ]
}

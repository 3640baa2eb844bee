//! Archive fixtures built with the real tools

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

use arcpipe::{ArchiveManager, Config, StagingConfig};

/// RPM lead magic
pub const RPM_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];

/// Payload offset produced by [`rpm_package`]
pub const RPM_PAYLOAD_OFFSET: u64 = 362;

/// Files of the sample project tree, relative to its parent
pub const PROJECT_FILES: &[(&str, &str)] = &[
    ("project/README.md", "# Sample project\n"),
    ("project/docs/guide.md", "Read me first.\n"),
    ("project/notes.txt", "remember the milk\n"),
];

/// Manager staging under `temp`
pub fn manager_in(temp: &TempDir) -> ArchiveManager {
    manager_with(temp, Config::default())
}

/// Manager staging under `temp`, starting from `config`
pub fn manager_with(temp: &TempDir, config: Config) -> ArchiveManager {
    let config = Config {
        staging: StagingConfig {
            staging_dir: temp.path().join("staging"),
        },
        ..config
    };
    ArchiveManager::new(config).expect("valid config")
}

/// Write [`PROJECT_FILES`] under `root`, returning the `project` directory
pub fn write_project(root: &Path) -> PathBuf {
    for (name, content) in PROJECT_FILES {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().expect("file has a parent")).expect("mkdir");
        std::fs::write(&path, content).expect("write fixture file");
    }
    root.join("project")
}

fn run(command: &mut Command) {
    let status = command.status().expect("spawn fixture tool");
    assert!(status.success(), "fixture command failed: {command:?}");
}

/// Build `<root>/<name>` from the project tree with `tar <flags>`
pub fn tar_archive(root: &Path, name: &str, create_flags: &str) -> PathBuf {
    let source = root.join("src");
    write_project(&source);
    let archive = root.join(name);
    run(Command::new("tar")
        .arg(create_flags)
        .arg(&archive)
        .arg("project")
        .current_dir(&source));
    archive
}

/// Build a newc cpio archive of the project tree
pub fn cpio_archive(root: &Path) -> Vec<u8> {
    let source = root.join("cpio-src");
    write_project(&source);

    let mut child = Command::new("cpio")
        .args(["-o", "-H", "newc"])
        .current_dir(&source)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn cpio");
    let list = "project\nproject/README.md\nproject/docs\nproject/docs/guide.md\nproject/notes.txt\n";
    child
        .stdin
        .take()
        .expect("stdin piped")
        .write_all(list.as_bytes())
        .expect("write file list");
    let output = child.wait_with_output().expect("cpio output");
    assert!(output.status.success());
    output.stdout
}

/// Compress `data` with `gzip -c`
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut child = Command::new("gzip")
        .arg("-c")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn gzip");
    let mut stdin = child.stdin.take().expect("stdin piped");
    let input = data.to_vec();
    // Feed from a thread so a large input cannot deadlock against stdout
    let writer = std::thread::spawn(move || stdin.write_all(&input));
    let output = child.wait_with_output().expect("gzip output");
    writer.join().expect("writer thread").expect("write gzip input");
    assert!(output.status.success());
    output.stdout
}

/// RPM package bytes: signature (2, 100), header (3, 50), then `payload`
///
/// Index and data sections are zero-filled; the payload starts at
/// [`RPM_PAYLOAD_OFFSET`].
pub fn rpm_package(payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 96];
    bytes[..4].copy_from_slice(&RPM_MAGIC);
    for (i, (il, dl)) in [(2u32, 100u32), (3, 50)].into_iter().enumerate() {
        bytes.extend_from_slice(&[0x8e, 0xad, 0xe8, 0x01, 0, 0, 0, 0]);
        bytes.extend_from_slice(&il.to_be_bytes());
        bytes.extend_from_slice(&dl.to_be_bytes());
        bytes.resize(bytes.len() + 16 * il as usize + dl as usize, 0);
        if i == 0 {
            bytes.resize(bytes.len().div_ceil(8) * 8, 0);
        }
    }
    assert_eq!(bytes.len() as u64, RPM_PAYLOAD_OFFSET);
    bytes.extend_from_slice(payload);
    bytes
}

/// Write an RPM package to `<root>/<name>`
pub fn write_rpm(root: &Path, name: &str, payload: &[u8]) -> PathBuf {
    let path = root.join(name);
    std::fs::write(&path, rpm_package(payload)).expect("write rpm");
    path
}

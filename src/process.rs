//! External process spawning
//!
//! Commands are argument-token sequences handed straight to the OS; no shell
//! is involved, so filenames never need quoting. A working directory applies
//! to the child only and never touches the host process's own working
//! directory.

use futures::FutureExt;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use crate::error::SpawnError;
use crate::types::ExitStatus;

/// A command template: program, arguments and optional working directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Start a command for `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Append one argument token
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several argument tokens
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the child in `dir`
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program token
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Argument tokens after the program
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Working directory of the child, if any
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Full token sequence, program first
    pub fn tokens(&self) -> Vec<OsString> {
        std::iter::once(self.program.clone().into_os_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Spawn this command
    pub fn spawn(&self) -> Result<ProcessHandle, SpawnError> {
        spawn(&self.tokens(), self.working_dir())
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Which output stream of a process to read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSelector {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Result of a non-blocking read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadChunk {
    /// Bytes that were already buffered
    Data(Vec<u8>),
    /// Nothing buffered right now
    Pending,
    /// The stream is closed (or was handed to the reactor)
    EndOfStream,
}

/// A spawned external process with captured stdout and stderr
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Spawn `tokens[0]` with the remaining tokens as arguments
///
/// Stdin is closed; stdout and stderr are captured as independent streams.
/// The child is killed if its handle (or the reactor source owning it) is
/// dropped before it exits.
///
/// # Errors
///
/// - [`SpawnError::EmptyCommand`] for an empty token list
/// - [`SpawnError::WorkingDirectory`] when `working_dir` is missing or not a directory
/// - [`SpawnError::NotFound`] when the executable cannot be located
/// - [`SpawnError::Io`] for any other OS failure
pub fn spawn<S: AsRef<OsStr>>(
    tokens: &[S],
    working_dir: Option<&Path>,
) -> Result<ProcessHandle, SpawnError> {
    let (program, args) = tokens.split_first().ok_or(SpawnError::EmptyCommand)?;
    let program_name = program.as_ref().to_string_lossy().into_owned();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = working_dir {
        check_working_dir(dir)?;
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SpawnError::NotFound {
            program: program_name.clone(),
        },
        _ => SpawnError::Io {
            program: program_name.clone(),
            source: e,
        },
    })?;

    let pid = child.id();
    debug!(program = %program_name, ?pid, ?working_dir, "spawned external tool");

    Ok(ProcessHandle {
        program: program_name,
        pid,
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        child,
    })
}

fn check_working_dir(dir: &Path) -> Result<(), SpawnError> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SpawnError::WorkingDirectory {
            path: dir.to_path_buf(),
            reason: "not a directory".to_string(),
        }),
        Err(e) => Err(SpawnError::WorkingDirectory {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

impl ProcessHandle {
    /// Program token the process was started with
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process ID, if the process had not exited at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand the stdout stream to someone else (usually the reactor)
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Hand the stderr stream to someone else (usually the reactor)
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Give up the child for exit watching
    pub fn into_child(self) -> Child {
        self.child
    }

    /// Read whatever is buffered on `stream` without waiting
    ///
    /// Returns at most `max` bytes. Once a stream reports end-of-stream it is
    /// dropped, and later calls keep returning [`ReadChunk::EndOfStream`].
    pub fn read_available(
        &mut self,
        stream: StreamSelector,
        max: usize,
    ) -> std::io::Result<ReadChunk> {
        match stream {
            StreamSelector::Stdout => poll_read(&mut self.stdout, max),
            StreamSelector::Stderr => poll_read(&mut self.stderr, max),
        }
    }

    /// Wait for the process to terminate
    pub async fn wait_status(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        Ok(ExitStatus::from(status))
    }

    /// Exit status if the process has already terminated
    pub fn try_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?.map(ExitStatus::from))
    }

    /// Ask the OS to kill the process
    pub fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

fn poll_read<R: AsyncRead + Unpin>(
    slot: &mut Option<R>,
    max: usize,
) -> std::io::Result<ReadChunk> {
    let Some(reader) = slot.as_mut() else {
        return Ok(ReadChunk::EndOfStream);
    };

    let mut buf = vec![0u8; max.max(1)];
    match reader.read(&mut buf).now_or_never() {
        None => Ok(ReadChunk::Pending),
        Some(Ok(0)) => {
            *slot = None;
            Ok(ReadChunk::EndOfStream)
        }
        Some(Ok(n)) => {
            buf.truncate(n);
            Ok(ReadChunk::Data(buf))
        }
        Some(Err(e)) => Err(e),
    }
}

//! Runs one coordinator-supplied command line as a bounded subprocess.

pub mod staging;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub use staging::{StagedFile, StagedFiles, StagingError, SweepReport, TempFileStore};

const PIPE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}")]
    FilePayload(StagingError),
    #[error("failed to stage files: {0}")]
    Staging(StagingError),
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to start '{program}': {source}")]
    Spawn { program: String, source: io::Error },
    #[error("command timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("command failed: {0}")]
    Command(String),
    #[error("io error while running command: {0}")]
    Io(#[from] io::Error),
}

impl From<StagingError> for ExecError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::Decode { .. } => ExecError::FilePayload(err),
            StagingError::Write { .. } => ExecError::Staging(err),
        }
    }
}

#[derive(Debug, Error)]
#[error("command path '{path}' not found: {source}")]
pub struct ProgramLookupError {
    pub path: String,
    pub source: which::Error,
}

/// Program and argument vector derived from a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Whitespace tokenization only; the line never reaches a shell. With a
    /// fixed `program` every token becomes an argument.
    pub fn parse(command: &str, program: Option<&Path>) -> Result<Self, ExecError> {
        let mut tokens = command.split_whitespace().map(str::to_string);
        match program {
            Some(program) => Ok(Self {
                program: program.to_string_lossy().into_owned(),
                args: tokens.collect(),
            }),
            None => {
                let program = tokens.next().ok_or(ExecError::EmptyCommand)?;
                Ok(Self {
                    program,
                    args: tokens.collect(),
                })
            }
        }
    }
}

#[derive(Debug)]
pub struct CommandExecutor {
    program: Option<PathBuf>,
    timeout: Duration,
    store: Arc<TempFileStore>,
}

impl CommandExecutor {
    pub fn new(program: Option<PathBuf>, timeout: Duration, store: Arc<TempFileStore>) -> Self {
        Self {
            program,
            timeout,
            store,
        }
    }

    /// Resolves the configured command path before anything else starts.
    pub fn with_command_path(
        command_path: Option<&str>,
        timeout: Duration,
        store: Arc<TempFileStore>,
    ) -> Result<Self, ProgramLookupError> {
        let program = command_path
            .map(|path| {
                which::which(path).map_err(|source| ProgramLookupError {
                    path: path.to_string(),
                    source,
                })
            })
            .transpose()?;
        if let Some(program) = &program {
            info!(target: "connector::executor", program = %program.display(), "using fixed command program");
        }
        Ok(Self::new(program, timeout, store))
    }

    pub fn store(&self) -> &Arc<TempFileStore> {
        &self.store
    }

    pub async fn execute(
        &self,
        command: &str,
        working_directory: Option<&str>,
        files: &BTreeMap<String, String>,
    ) -> Result<String, ExecError> {
        info!(target: "connector::executor", command, "executing command");

        let invocation = Invocation::parse(command, self.program.as_deref())?;
        let mut staged = self.store.stage(files).await?;
        let outcome = self.run(&invocation, working_directory).await;
        staged.release();
        outcome
    }

    async fn run(
        &self,
        invocation: &Invocation,
        working_directory: Option<&str>,
    ) -> Result<String, ExecError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = working_directory {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let collected = tokio::time::timeout(self.timeout, collect(&mut child, stdout, stderr)).await;
        let (status, stdout, stderr) = match collected {
            Ok(result) => result?,
            Err(_) => {
                terminate_tree(&mut child).await;
                warn!(
                    target: "connector::executor",
                    program = %invocation.program,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "command timed out; process tree killed"
                );
                return Err(ExecError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("'{}' exited with {}", invocation.program, describe_exit_status(status))
            } else {
                stderr.to_string()
            };
            debug!(target: "connector::executor", program = %invocation.program, status = %describe_exit_status(status), "command failed");
            return Err(ExecError::Command(message));
        }

        let output = combine_output(&stdout, &stderr);
        debug!(target: "connector::executor", program = %invocation.program, output_len = output.len(), "command finished");
        Ok(output)
    }
}

/// Drains both pipes while waiting for the child. Once the child has exited
/// the pipes get `PIPE_GRACE` to reach EOF; a detached descendant still
/// holding them open does not hold up the result.
async fn collect(
    child: &mut Child,
    stdout: Option<impl AsyncRead + Unpin>,
    stderr: Option<impl AsyncRead + Unpin>,
) -> Result<(ExitStatus, String, String), ExecError> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let (status, drained) = {
        let reads = async {
            let (out_res, err_res) = tokio::join!(read_into(stdout, &mut out), read_into(stderr, &mut err));
            out_res.and(err_res)
        };
        tokio::pin!(reads);
        let mut drained = None;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                result = &mut reads, if drained.is_none() => drained = Some(result),
            }
        };
        if drained.is_none() {
            drained = tokio::time::timeout(PIPE_GRACE, &mut reads).await.ok();
        }
        (status, drained)
    };
    match drained {
        Some(result) => result?,
        None => debug!(
            target: "connector::executor",
            "output pipes still open after exit; returning what was read"
        ),
    }
    Ok((
        status,
        String::from_utf8_lossy(&out).into_owned(),
        String::from_utf8_lossy(&err).into_owned(),
    ))
}

/// Appends as it reads so a cancelled read keeps what already arrived.
async fn read_into(stream: Option<impl AsyncRead + Unpin>, buf: &mut Vec<u8>) -> io::Result<()> {
    let Some(mut stream) = stream else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

async fn terminate_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own process group, so the negative pid reaches
        // every descendant that did not detach.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            debug!(target: "connector::executor", pid, error = %io::Error::last_os_error(), "process group kill failed");
        }
    }
    if let Err(err) = child.kill().await {
        debug!(target: "connector::executor", error = %err, "child kill after timeout failed");
    }
}

/// stdout, then stderr on its own line when present, trimmed.
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    let mut combined = stdout.to_string();
    if !stderr.is_empty() {
        combined.push('\n');
        combined.push_str(stderr);
    }
    combined.trim().to_string()
}

pub fn describe_exit_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }

    "unknown status".to_string()
}

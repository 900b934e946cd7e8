use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::{TempDir, TempPath};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o failure around `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` was cancelled")]
    Cancelled { command: String },

    #[error("`{command}` could not be stopped, even by force")]
    Unkillable { command: String },
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    scratch_prefix: Option<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            scratch_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Give the child a private temporary folder (exported as `TMPDIR`),
    /// removed once the child is gone.
    pub fn scratch_dir(mut self, prefix: impl Into<String>) -> Self {
        self.scratch_prefix = Some(prefix.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// The first three argv tokens, used in logs and errors. Later
    /// arguments (which may carry credentials) and the environment never
    /// appear here.
    pub fn display_name(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .take(3)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn file_prefix(&self) -> String {
        let stem = Path::new(&self.program)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "process".to_string());
        let stem: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        format!("{stem}-")
    }
}

/// A finished process. Its captured output lives in temporary files that are
/// deleted when this value is dropped.
#[derive(Debug)]
pub struct ProcessOutput {
    command: String,
    exit_code: i32,
    elapsed: Duration,
    stdout: TempPath,
    stderr: TempPath,
}

impl ProcessOutput {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit code; `-1` when the process was ended by a signal.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr
    }

    pub async fn stdout_reader(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.stdout).await
    }

    pub async fn stdout_string(&self) -> std::io::Result<String> {
        read_lossy(&self.stdout).await
    }

    pub async fn stderr_string(&self) -> std::io::Result<String> {
        read_lossy(&self.stderr).await
    }
}

async fn read_lossy(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

const TAIL_LINES: usize = 20;

/// The last `max_lines` lines of a captured output file. Unreadable files
/// yield an empty string.
async fn tail(path: &Path, max_lines: usize) -> String {
    let content = read_lossy(path).await.unwrap_or_default();
    let lines: Vec<&str> = content.lines().collect();
    lines[lines.len().saturating_sub(max_lines)..].join("\n")
}

async fn log_output_tail(command: &str, stdout: &Path, stderr: &Path, message: &str) {
    let stdout = tail(stdout, TAIL_LINES).await;
    let stderr = tail(stderr, TAIL_LINES).await;
    warn!(command, stdout = %stdout, stderr = %stderr, "{message}");
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs external programs with a timeout, capturing their output and making
/// sure nothing outlives the call.
///
/// On timeout or cancellation the child receives SIGTERM, then SIGKILL after
/// `grace_period`. A child still alive after another `grace_period` is
/// reported as [`ProcessError::Unkillable`].
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub async fn run(
        &self,
        spec: &ProcessSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        let command = spec.display_name();

        let scratch = match &spec.scratch_prefix {
            Some(prefix) => Some(
                tempfile::Builder::new()
                    .prefix(prefix.as_str())
                    .tempdir()
                    .map_err(|source| ProcessError::Io {
                        command: command.clone(),
                        source,
                    })?,
            ),
            None => None,
        };

        let result = self
            .run_in(spec, &command, timeout, cancel, scratch.as_ref().map(TempDir::path))
            .await;

        if let Some(dir) = scratch {
            let path = dir.path().to_path_buf();
            trace!(command = %command, path = %path.display(), "deleting scratch folder");
            if let Err(e) = dir.close() {
                warn!(command = %command, path = %path.display(), error = %e, "failed to delete scratch folder");
            }
        }

        result
    }

    async fn run_in(
        &self,
        spec: &ProcessSpec,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        scratch: Option<&Path>,
    ) -> Result<ProcessOutput, ProcessError> {
        let io_err = |source: std::io::Error| ProcessError::Io {
            command: command.to_string(),
            source,
        };

        let prefix = spec.file_prefix();
        let (stdout_file, stdout) = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".stdout")
            .tempfile()
            .map_err(io_err)?
            .into_parts();
        let (stderr_file, stderr) = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".stderr")
            .tempfile()
            .map_err(io_err)?
            .into_parts();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);
        if let Some(dir) = scratch {
            cmd.env("TMPDIR", dir);
        }

        debug!(command, timeout_ms = timeout.as_millis() as u64, "starting process");
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let waited = tokio::select! {
            biased;
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(status) => status.map_err(io_err)?,
            Waited::TimedOut => {
                warn!(command, timeout_ms = timeout.as_millis() as u64, "process timed out; terminating it");
                self.terminate(&mut child, command, &stdout, &stderr).await?;
                log_output_tail(command, &stdout, &stderr, "timed out process output").await;
                return Err(ProcessError::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            }
            Waited::Cancelled => {
                debug!(command, "process cancelled; terminating it");
                self.terminate(&mut child, command, &stdout, &stderr).await?;
                log_output_tail(command, &stdout, &stderr, "cancelled process output").await;
                return Err(ProcessError::Cancelled {
                    command: command.to_string(),
                });
            }
        };

        let output = ProcessOutput {
            command: command.to_string(),
            exit_code: status.code().unwrap_or(-1),
            elapsed: started.elapsed(),
            stdout,
            stderr,
        };

        if output.success() {
            trace!(
                command,
                elapsed_ms = output.elapsed.as_millis() as u64,
                "process exited successfully"
            );
            if tracing::enabled!(tracing::Level::DEBUG) {
                let stdout = output.stdout_string().await.unwrap_or_default();
                debug!(command, stdout = %stdout, "process output");
            }
        } else {
            let stdout = output.stdout_string().await.unwrap_or_default();
            let stderr = output.stderr_string().await.unwrap_or_default();
            error!(
                command,
                exit_code = output.exit_code,
                stdout = %stdout,
                stderr = %stderr,
                "process exited with a failure"
            );
        }

        Ok(output)
    }

    async fn terminate(
        &self,
        child: &mut Child,
        command: &str,
        stdout: &Path,
        stderr: &Path,
    ) -> Result<(), ProcessError> {
        send_terminate(child, command);
        if self.wait_for_exit(child).await {
            return Ok(());
        }

        warn!(
            command,
            grace_ms = self.grace_period.as_millis() as u64,
            "process ignored the termination request; killing it"
        );
        if let Err(e) = child.start_kill() {
            warn!(command, error = %e, "failed to kill process");
        }
        if self.wait_for_exit(child).await {
            return Ok(());
        }

        let stdout = tail(stdout, TAIL_LINES).await;
        let stderr = tail(stderr, TAIL_LINES).await;
        error!(
            command,
            stdout = %stdout,
            stderr = %stderr,
            "process is still alive after being killed"
        );
        Err(ProcessError::Unkillable {
            command: command.to_string(),
        })
    }

    async fn wait_for_exit(&self, child: &mut Child) -> bool {
        matches!(
            tokio::time::timeout(self.grace_period, child.wait()).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, command: &str) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // `id()` is None once the child has been reaped.
    let Some(pid) = child.id() else {
        return;
    };
    match i32::try_from(pid) {
        Ok(raw) => {
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                warn!(command, pid, error = %e, "failed to send SIGTERM");
            }
        }
        Err(_) => warn!(command, pid, "pid out of range; skipping SIGTERM"),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, command: &str) {
    if let Err(e) = child.start_kill() {
        warn!(command, error = %e, "failed to stop process");
    }
}

//! Bounded subprocess execution.
//!
//! Commands are spawned directly (program + argv, no shell) with a working
//! directory, extra environment and a wall-clock limit. A non-zero exit status
//! is a normal outcome; only spawn failures, I/O failures, timeouts and
//! cancellation are errors.
//!
//! On Unix each child is placed in its own process group so that a timeout or
//! cancellation kills everything it started, not just the direct child.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Default per-stream capture cap.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// A command to run inside the sandbox.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            timeout,
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
        self.env.insert(key.into(), value.into());
        self
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process was ended by a signal.
    pub exit_code: i32,
    pub truncated: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while running process: {0}")]
    Io(#[from] io::Error),

    #[error("Process timed out after {} ms and was killed", .timeout.as_millis())]
    Timeout {
        timeout: Duration,
        /// Pid of the killed child, already reaped when this is returned.
        pid: Option<u32>,
    },

    #[error("Process was cancelled and killed")]
    Cancelled,
}

/// Runs commands with bounded time and output.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    max_output_bytes: usize,
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

impl ProcessSandbox {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            max_output_bytes: max_output_bytes.max(1),
        }
    }

    /// Run a command to completion, timeout or cancellation.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, SandboxError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(cwd = %spec.cwd.display(), "Spawning: {}", spec.display());

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let cap = self.max_output_bytes;
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_capped(s, cap)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_capped(s, cap)));

        let waited = tokio::select! {
            res = tokio::time::timeout(spec.timeout, child.wait()) => Some(res),
            _ = cancel.cancelled() => None,
        };

        let status = match waited {
            Some(Ok(Ok(status))) => status,
            Some(Ok(Err(e))) => {
                terminate(&mut child, pid).await;
                abort_readers(stdout_task, stderr_task);
                return Err(SandboxError::Io(e));
            }
            Some(Err(_)) => {
                tracing::warn!(
                    pid,
                    timeout_ms = spec.timeout.as_millis() as u64,
                    "Process timed out, killing: {}",
                    spec.display()
                );
                terminate(&mut child, pid).await;
                abort_readers(stdout_task, stderr_task);
                return Err(SandboxError::Timeout {
                    timeout: spec.timeout,
                    pid,
                });
            }
            None => {
                tracing::info!(pid, "Process cancelled, killing: {}", spec.display());
                terminate(&mut child, pid).await;
                abort_readers(stdout_task, stderr_task);
                return Err(SandboxError::Cancelled);
            }
        };

        // Background jobs left behind would hold the pipes open.
        kill_group(pid);

        let (stdout, stdout_truncated) = collect(stdout_task).await?;
        let (stderr, stderr_truncated) = collect(stderr_task).await?;
        let exit_code = status.code().unwrap_or(-1);

        tracing::debug!(
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Process completed"
        );

        Ok(ProcessOutput {
            stdout: sanitize_output(&stdout),
            stderr: sanitize_output(&stderr),
            exit_code,
            truncated: stdout_truncated || stderr_truncated,
        })
    }
}

type ReaderTask = tokio::task::JoinHandle<io::Result<(Vec<u8>, bool)>>;

/// Read a stream to EOF, keeping at most `cap` bytes and draining the rest so
/// the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if room >= n {
            kept.extend_from_slice(&buf[..n]);
        } else {
            kept.extend_from_slice(&buf[..room]);
            truncated = true;
        }
    }
    Ok((kept, truncated))
}

async fn collect(task: Option<ReaderTask>) -> Result<(Vec<u8>, bool), SandboxError> {
    match task {
        Some(handle) => match handle.await {
            Ok(res) => Ok(res?),
            Err(e) => Err(SandboxError::Io(io::Error::new(io::ErrorKind::Other, e))),
        },
        None => Ok((Vec::new(), false)),
    }
}

fn abort_readers(stdout: Option<ReaderTask>, stderr: Option<ReaderTask>) {
    for task in [stdout, stderr].into_iter().flatten() {
        task.abort();
    }
}

/// SIGKILL the process group created for a child.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            // SAFETY: kill(2) with a negative pid signals the process group we
            // created for this child; it has no memory-safety preconditions.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Kill the child's whole process group and reap the child.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.kill().await {
        tracing::debug!("Child already exited while killing: {}", e);
    }
}

/// Sanitize command output to be safe for LLM consumption.
/// Removes binary garbage while preserving valid text.
pub fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% non-printable (excluding newlines/tabs) is treated as binary
    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text = String::from_utf8_lossy(bytes);

    // Keep: newlines, tabs, carriage returns
    text.chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn sh(script: &str, cwd: &std::path::Path, timeout: Duration) -> CommandSpec {
        CommandSpec::new("sh", cwd, timeout).args(["-c", script])
    }

    #[tokio::test]
    async fn test_captures_output_and_nonzero_exit() {
        let temp = tempdir().unwrap();
        let sandbox = ProcessSandbox::default();
        let spec = sh("echo out; echo err >&2; exit 3", temp.path(), Duration::from_secs(10));

        let output = sandbox.run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert!(!output.truncated);
    }

    #[tokio::test]
    async fn test_runs_in_cwd_with_env() {
        let temp = tempdir().unwrap();
        let sandbox = ProcessSandbox::default();
        let spec = sh("pwd; echo \"$GREETING\"", temp.path(), Duration::from_secs(10))
            .env("GREETING", "hello");

        let output = sandbox.run(&spec, &CancellationToken::new()).await.unwrap();
        let mut lines = output.stdout.lines();
        let cwd = std::fs::canonicalize(temp.path()).unwrap();
        assert_eq!(std::fs::canonicalize(lines.next().unwrap()).unwrap(), cwd);
        assert_eq!(lines.next(), Some("hello"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let temp = tempdir().unwrap();
        let sandbox = ProcessSandbox::default();
        let spec = sh("sleep 30", temp.path(), Duration::from_millis(200));

        let started = Instant::now();
        let err = sandbox.run(&spec, &CancellationToken::new()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));

        let SandboxError::Timeout { pid: Some(pid), .. } = err else {
            panic!("expected timeout, got {err:?}");
        };
        // The child has been killed and reaped, so the pid is gone.
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        assert!(!alive, "process {pid} still running after timeout");
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let temp = tempdir().unwrap();
        let sandbox = ProcessSandbox::default();
        let spec = sh("sleep 30", temp.path(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = sandbox.run(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let temp = tempdir().unwrap();
        let sandbox = ProcessSandbox::new(16);
        let script = "i=0; while [ $i -lt 1000 ]; do echo line; i=$((i+1)); done";
        let spec = sh(script, temp.path(), Duration::from_secs(10));

        let output = sandbox.run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout.len(), 16);
        assert!(output.truncated);
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let temp = tempdir().unwrap();
        let sandbox = ProcessSandbox::default();
        let spec = CommandSpec::new("no-such-binary-xyz", temp.path(), Duration::from_secs(1));

        let err = sandbox.run(&spec, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[test]
    fn test_sanitize_output_detects_binary() {
        let binary = vec![0u8; 200];
        assert!(sanitize_output(&binary).starts_with("[Binary output detected"));
        assert_eq!(sanitize_output(b"a\x07b\n"), "ab\n");
    }
}

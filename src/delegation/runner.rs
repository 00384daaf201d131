//! Subprocess execution with a wall-clock timeout and bounded capture.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default per-stream capture limit.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Appended to a stream whose capture hit the limit.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// How long to keep draining pipes after the child is gone. A grandchild
/// that inherited stdout can hold the pipe open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self {
            argv,
            timeout,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// What a finished (or killed) process produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Either stream hit the capture limit.
    pub truncated: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs provider commands. An `Err` means the process could not be started.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &ProcessSpec) -> io::Result<ProcessOutput>;
}

/// Runs commands with tokio; the child is killed if the future is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &ProcessSpec) -> io::Result<ProcessOutput> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        debug!(
            program = %program,
            args = args.len(),
            timeout_ms = spec.timeout.as_millis() as u64,
            "spawning provider command"
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn()?;

        let cap = spec.max_output_bytes;
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_capped(s, cap)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_capped(s, cap)));

        let (exit_code, timed_out) = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(
                    program = %program,
                    timeout_ms = spec.timeout.as_millis() as u64,
                    "provider command timed out, killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed out command");
                }
                (None, true)
            }
        };

        let (stdout, stdout_truncated) = collect(stdout_task).await;
        let (stderr, stderr_truncated) = collect(stderr_task).await;
        let elapsed = started.elapsed();

        debug!(
            exit_code = ?exit_code,
            timed_out,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "provider command finished"
        );

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
            truncated: stdout_truncated || stderr_truncated,
            elapsed,
        })
    }
}

/// Read a stream to the end, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    buf.extend_from_slice(&chunk[..room]);
                    truncated = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
    (buf, truncated)
}

async fn collect(task: Option<JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    let Some(mut task) = task else {
        return (String::new(), false);
    };
    let (bytes, truncated) = match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(err)) => {
            warn!(error = %err, "output reader failed");
            (Vec::new(), false)
        }
        Err(_) => {
            task.abort();
            (Vec::new(), true)
        }
    };

    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    (text, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> ProcessSpec {
        ProcessSpec::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        )
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let output = TokioProcessRunner
            .run(&sh("echo hello; echo oops >&2", Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.truncated);
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let output = TokioProcessRunner
            .run(&sh("exit 3", Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = Instant::now();
        let output = TokioProcessRunner
            .run(&sh("exec sleep 10", Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let spec = sh("printf '%0200d' 0", Duration::from_secs(5)).with_max_output_bytes(64);
        let output = TokioProcessRunner.run(&spec).await.unwrap();

        assert!(output.truncated);
        assert!(output.stdout.starts_with(&"0".repeat(64)));
        assert!(output.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(output.stdout.len(), 64 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = ProcessSpec::new(
            vec!["conjure-definitely-not-a-real-binary".to_string()],
            Duration::from_secs(1),
        );
        assert!(TokioProcessRunner.run(&spec).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_argv_is_error() {
        let spec = ProcessSpec::new(Vec::new(), Duration::from_secs(1));
        assert!(TokioProcessRunner.run(&spec).await.is_err());
    }
}

//! External process plumbing
//!
//! Two shapes: a bounded run that collects all output, and a follow process
//! read incrementally until the caller tears it down. Every child is spawned
//! with `kill_on_drop`, so dropping a handle on any path kills the process.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LogError, Result};
use crate::source::SourceCommand;

/// Bytes of stderr kept for diagnostics
const STDERR_CAPTURE_LIMIT: usize = 8 * 1024;

/// Run a command to completion and return its stdout
///
/// Fails with `SourceUnavailable` if the process cannot start or exits
/// non-zero (stderr attached), `Timeout` after `limit`, `Cancelled` if
/// `cancel` fires first. The child is killed on timeout and cancellation.
pub async fn run_bounded(
    command: &SourceCommand,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    if cancel.is_cancelled() {
        return Err(LogError::Cancelled);
    }

    let child = command
        .to_command()
        .spawn()
        .map_err(|e| LogError::unavailable(command.to_string(), e.to_string()))?;

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(LogError::Cancelled),
        result = tokio::time::timeout(limit, child.wait_with_output()) => match result {
            Err(_) => return Err(LogError::Timeout { after: limit }),
            Ok(output) => output.map_err(|e| LogError::unavailable(command.to_string(), e.to_string()))?,
        },
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LogError::unavailable(
            command.to_string(),
            describe_exit(output.status, &stderr),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn describe_exit(status: ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {stderr}")
    }
}

/// A long-running child whose stdout is read incrementally
#[derive(Debug)]
pub struct FollowProcess {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    command: SourceCommand,
}

impl FollowProcess {
    /// Spawn the command and attach to its output pipe
    pub fn spawn(command: &SourceCommand) -> Result<Self> {
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|e| LogError::unavailable(command.to_string(), e.to_string()))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            LogError::unavailable(command.to_string(), "stdout pipe not attached")
        })?;
        // Drained in the background so a chatty stderr never blocks the child
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(capture_stderr(pipe)));

        Ok(Self {
            child,
            stdout,
            stderr,
            command: command.clone(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read whatever is available; `Ok(0)` is end of stream
    ///
    /// Cancel-safe: dropping the future loses no bytes.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf).await
    }

    /// Kill the child and wait for it to be reaped
    pub async fn terminate(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(command = %self.command, error = %e, "kill failed, child already gone");
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
    }

    /// Wait for the child to exit after its stdout closed
    ///
    /// A non-zero exit becomes `SourceUnavailable` with captured stderr.
    /// Returns `Ok(false)` if `cancel` fired first (the child is killed).
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<bool> {
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                self.terminate().await;
                return Ok(false);
            }
            status = self.child.wait() => status
                .map_err(|e| LogError::unavailable(self.command.to_string(), e.to_string()))?,
        };

        if status.success() {
            return Ok(true);
        }

        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Err(LogError::unavailable(
            self.command.to_string(),
            describe_exit(status, &stderr),
        ))
    }
}

async fn capture_stderr<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_CAPTURE_LIMIT.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

/// Reassembles lines from arbitrary byte chunks
///
/// Reads may end mid-line or mid-character; only complete lines are decoded.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let Some(last_newline) = self.buf.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.buf.drain(..=last_newline).collect();
        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(strip_cr(line)).into_owned())
            .collect()
    }

    /// Take the bytes after the last newline, if any
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(strip_cr(&rest)).into_owned())
    }

    /// Discard the bytes after the last newline
    pub fn discard_remainder(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

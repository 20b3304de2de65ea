//! Shell command execution with streamed output
//!
//! Commands are passed to a POSIX shell (`sh -c`) in their own process
//! group, with stdout and stderr merged into a single line stream. Each
//! complete line is delivered, with a monotonic 0-based index, to an
//! optional bounded channel: when the consumer is slow the channel fills
//! and pipe consumption pauses, so lines are never dropped or reordered.
//! Timeout expiry and external cancellation both terminate the whole
//! process group.

use crate::errors::ShellError;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the line channel handed to output consumers
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Time budget for workspace and container lifecycle commands
pub const LIFECYCLE_CMD_TIMEOUT: Duration = Duration::from_secs(600);

/// One complete output line with its position in the merged stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Monotonic 0-based index within this command's output
    pub index: u64,
    /// Line content without the trailing newline
    pub line: String,
}

/// Seam for running shell commands
///
/// The host implementation is [`ShellExec`]; tests and the docker layer
/// substitute recording fakes so command construction can be asserted
/// without touching a real daemon.
#[async_trait]
pub trait Exec: Send + Sync {
    async fn exec(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        envvars: &IndexMap<String, String>,
        out_tx: Option<mpsc::Sender<OutputLine>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, ShellError>;
}

/// Host shell executor
#[derive(Debug, Default, Clone)]
pub struct ShellExec;

#[async_trait]
impl Exec for ShellExec {
    async fn exec(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        envvars: &IndexMap<String, String>,
        out_tx: Option<mpsc::Sender<OutputLine>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, ShellError> {
        exec_cmd(cmd, cwd, timeout, envvars, out_tx, cancel).await
    }
}

/// Run `sh -c <cmd>` and collect its merged output
///
/// On exit code 0 the merged stdout+stderr is returned with the trailing
/// newline stripped. A non-zero exit yields [`ShellError::Failed`] carrying
/// the same merged output. Timeout and cancellation terminate the process
/// group and yield [`ShellError::Timeout`] / [`ShellError::Cancelled`].
pub async fn exec_cmd(
    cmd: &str,
    cwd: &Path,
    timeout: Duration,
    envvars: &IndexMap<String, String>,
    out_tx: Option<mpsc::Sender<OutputLine>>,
    cancel: &CancellationToken,
) -> std::result::Result<String, ShellError> {
    debug!(command = %cmd, cwd = %cwd.display(), "Executing shell command");

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    for (key, value) in envvars {
        command.env(key, value);
    }

    let mut child = command.spawn()?;
    let pid = child.id();

    let (line_tx, mut line_rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(copy_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(copy_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    enum Interrupt {
        Timeout,
        Cancelled,
    }

    let mut collected: Vec<String> = Vec::new();

    let waited = {
        let drain_and_wait = async {
            let mut index: u64 = 0;
            while let Some(line) = line_rx.recv().await {
                if let Some(tx) = &out_tx {
                    // A dropped receiver only disables streaming; the
                    // command keeps running and output keeps accumulating.
                    let _ = tx.send(OutputLine { index, line: line.clone() }).await;
                }
                collected.push(line);
                index += 1;
            }
            child.wait().await
        };
        tokio::select! {
            result = drain_and_wait => Ok(result),
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(Interrupt::Timeout),
        }
    };

    match waited {
        Ok(Ok(status)) => {
            let output = collected.join("\n");
            if status.success() {
                Ok(output)
            } else {
                debug!(exit_code = ?status.code(), command = %cmd, "Command failed");
                Err(ShellError::Failed { output })
            }
        }
        Ok(Err(source)) => Err(ShellError::Spawn { source }),
        Err(interrupt) => {
            kill_process_group(pid);
            let _ = child.start_kill();
            let _ = child.wait().await;
            match interrupt {
                Interrupt::Timeout => {
                    warn!(command = %cmd, seconds = timeout.as_secs(), "Command timed out");
                    Err(ShellError::Timeout {
                        seconds: timeout.as_secs(),
                    })
                }
                Interrupt::Cancelled => {
                    debug!(command = %cmd, "Command cancelled");
                    Err(ShellError::Cancelled)
                }
            }
        }
    }
}

/// Run a command with no streaming and the lifecycle time budget
pub async fn run_cmd(cmd: &str, cwd: &Path) -> std::result::Result<String, ShellError> {
    exec_cmd(
        cmd,
        cwd,
        LIFECYCLE_CMD_TIMEOUT,
        &IndexMap::new(),
        None,
        &CancellationToken::new(),
    )
    .await
}

/// Forward complete lines from one pipe into the merged channel.
/// `next_line` also yields a final unterminated fragment before EOF.
async fn copy_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Send SIGKILL to the process group rooted at `pid`
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // Negative pid targets the process group created via process_group(0).
        // SAFETY: plain POSIX kill(2) on a group this process created; no
        // memory is at stake.
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

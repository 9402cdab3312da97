//! External command execution with a deadline.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};

/// How long to wait for the output pipes to drain after killing a child.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, killing it if it is still running after
/// `timeout`.
///
/// A non-zero exit status is an error carrying the captured output.
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let command_line = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    info!(command = %command_line, "Running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DriverError::CommandFailed {
            command: command_line.clone(),
            stdout: String::new(),
            stderr: String::new(),
            reason: e.to_string(),
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    let status = match waited {
        Ok(status) => status,
        Err(_) => {
            warn!(command = %command_line, timeout_secs = timeout.as_secs_f64(), "Command timed out, killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill command");
            }
            return Err(DriverError::CommandTimeout {
                command: command_line,
                stdout: collect(stdout).await,
                stderr: collect(stderr).await,
            });
        }
    };

    let output = CommandOutput {
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
    };
    debug!(stdout = %output.stdout, stderr = %output.stderr, "Command output");

    match status {
        Ok(status) if status.success() => Ok(output),
        Ok(status) => Err(DriverError::CommandFailed {
            command: command_line,
            stdout: output.stdout,
            stderr: output.stderr,
            reason: status.to_string(),
        }),
        Err(e) => Err(DriverError::CommandFailed {
            command: command_line,
            stdout: output.stdout,
            stderr: output.stderr,
            reason: e.to_string(),
        }),
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!(error = %e, "Failed to read command output");
            }
        }
        buf
    })
}

// Grandchildren may keep a pipe open after the child is gone.
async fn collect(task: JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
        _ => String::new(),
    }
}

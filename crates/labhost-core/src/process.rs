//! Local subprocess execution with a bounded wait.
//!
//! Every command the lab server runs (`ssh`, `ping`, `dut-control`, `tar`)
//! goes through [`run_command`]. Stdout and stderr are drained on reader
//! threads so a chatty child can never fill a pipe and stall; the parent
//! waits with [`wait_timeout`] and kills and reaps the child on timeout.

use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::HostError;

/// Maximum bytes captured per stream.
const MAX_CAPTURE_SIZE: u64 = 16 * 1024 * 1024;

/// Exit status reported when a process was terminated by a signal.
pub const SIGNALLED_EXIT_STATUS: i32 = -1;

/// Result of running a command locally or on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// The command line as run.
    pub command: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit status ([`SIGNALLED_EXIT_STATUS`] if killed by a signal).
    pub exit_status: i32,
    /// Wall time the command took.
    pub duration: Duration,
}

impl CommandResult {
    /// Returns true if the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Converts a non-zero exit into [`HostError::CommandFailed`].
    pub fn check(self) -> Result<Self, HostError> {
        if self.success() {
            Ok(self)
        } else {
            Err(HostError::CommandFailed {
                command: self.command,
                exit_status: self.exit_status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }

    /// Standard output with surrounding whitespace removed.
    #[must_use]
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Keeps the first `limit` bytes and drains the rest, so the writer never
/// blocks on a full pipe.
fn read_pipe_bounded<R: Read>(mut reader: R, limit: u64) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    (&mut reader).take(limit).read_to_end(&mut buffer)?;
    io::copy(&mut reader, &mut io::sink())?;
    Ok(buffer)
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> mpsc::Receiver<std::io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    match pipe {
        Some(pipe) => {
            std::thread::spawn(move || {
                let _ = tx.send(read_pipe_bounded(pipe, MAX_CAPTURE_SIZE));
            });
        },
        None => {
            let _ = tx.send(Ok(Vec::new()));
        },
    }
    rx
}

fn collect(rx: &mpsc::Receiver<std::io::Result<Vec<u8>>>) -> String {
    match rx.recv() {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to read child output");
            String::new()
        },
        Err(_) => String::new(),
    }
}

/// Renders a command for logs and error messages.
#[must_use]
pub fn display_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Runs `cmd` to completion, capturing its output.
///
/// Stdin is closed. With `timeout` set, the child is killed and reaped once
/// the budget is spent and [`HostError::Timeout`] is returned. A non-zero exit
/// is not an error here; use [`CommandResult::check`].
pub fn run_command(cmd: &mut Command, timeout: Option<Duration>) -> Result<CommandResult, HostError> {
    let command = display_command(cmd);
    debug!(command = %command, "running local command");

    let started = Instant::now();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| HostError::io("spawning local command", e))?;

    let stdout_rx = spawn_reader(child.stdout.take());
    let stderr_rx = spawn_reader(child.stderr.take());

    let status = match timeout {
        Some(timeout) => {
            let waited = child
                .wait_timeout(timeout)
                .map_err(|e| HostError::io("waiting for local command", e))?;
            let Some(status) = waited else {
                let _ = child.kill();
                let _ = child.wait();
                warn!(command = %command, timeout_secs = timeout.as_secs(), "command timed out");
                return Err(HostError::timeout(format!("`{command}` to finish"), timeout));
            };
            status
        },
        None => child
            .wait()
            .map_err(|e| HostError::io("waiting for local command", e))?,
    };

    let stdout = collect(&stdout_rx);
    let stderr = collect(&stderr_rx);

    Ok(CommandResult {
        command,
        stdout,
        stderr,
        exit_status: status.code().unwrap_or(SIGNALLED_EXIT_STATUS),
        duration: started.elapsed(),
    })
}

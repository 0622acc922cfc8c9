//! [`Transport`] over the system OpenSSH client.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::{RunOptions, Transport};
use crate::clock::{Clock, SystemClock};
use crate::config::SshConfig;
use crate::error::HostError;
use crate::process::{CommandResult, run_command};

/// Exit status ssh reports for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Pause between liveness probes in `wait_up`/`wait_down`.
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Probe budget used by `wait_down` so an unreachable host is noticed quickly.
const DOWN_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn ssh_options(config: &SshConfig) -> Vec<String> {
    let mut options = vec![
        "StrictHostKeyChecking=no".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "BatchMode=yes".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)),
        "ServerAliveInterval=900".to_string(),
        "ServerAliveCountMax=3".to_string(),
        "ConnectionAttempts=4".to_string(),
        "Protocol=2".to_string(),
    ];
    options.extend(config.extra_options.iter().cloned());
    options.into_iter().flat_map(|o| ["-o".to_string(), o]).collect()
}

/// Arguments every ssh invocation to a DUT starts with: no agent or X11
/// forwarding, throwaway host keys, batch mode, then login user and port.
#[must_use]
pub fn ssh_base_args(config: &SshConfig) -> Vec<String> {
    let mut args = vec!["-a".to_string(), "-x".to_string()];
    args.extend(ssh_options(config));
    args.extend([
        "-l".to_string(),
        config.user.clone(),
        "-p".to_string(),
        config.port.to_string(),
    ]);
    args
}

/// SSH session to a DUT using the system `ssh` binary.
pub struct SshTransport {
    hostname: String,
    config: SshConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("hostname", &self.hostname)
            .field("user", &self.config.user)
            .field("port", &self.config.port)
            .finish_non_exhaustive()
    }
}

impl SshTransport {
    /// Creates a session description; nothing is connected until a command
    /// runs.
    #[must_use]
    pub fn new(hostname: impl Into<String>, config: SshConfig) -> Self {
        Self {
            hostname: hostname.into(),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` for liveness polling.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// SSH options this session uses.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    fn ssh_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(ssh_base_args(&self.config))
            .arg(&self.hostname)
            .arg(remote_command);
        cmd
    }
}

impl Transport for SshTransport {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn run_with(&self, command: &str, options: &RunOptions) -> Result<CommandResult, HostError> {
        debug!(hostname = %self.hostname, command, "running remote command");
        let mut result = run_command(&mut self.ssh_command(command), options.timeout)?;
        result.command = command.to_string();

        if result.exit_status == SSH_CONNECTION_FAILURE {
            return Err(HostError::transport(
                &self.hostname,
                format!("ssh failed: {}", result.stderr.trim()),
            ));
        }
        if options.ignore_status {
            Ok(result)
        } else {
            result.check()
        }
    }

    fn is_up(&self, timeout: Duration) -> bool {
        let options = RunOptions::new().timeout(timeout).ignore_status();
        match self.run_with("true", &options) {
            Ok(result) => result.success(),
            Err(e) => {
                trace!(hostname = %self.hostname, error = %e, "host not up");
                false
            },
        }
    }

    fn wait_up(&self, timeout: Duration) -> bool {
        let start = self.clock.now();
        loop {
            let remaining = timeout.saturating_sub(self.clock.since(start));
            if remaining.is_zero() {
                return false;
            }
            if self.is_up(remaining.min(self.config.connect_timeout)) {
                return true;
            }
            self.clock
                .sleep(LIVENESS_POLL_INTERVAL.min(timeout.saturating_sub(self.clock.since(start))));
        }
    }

    fn wait_down(&self, timeout: Duration, old_boot_id: Option<&str>) -> bool {
        let start = self.clock.now();
        loop {
            if !self.is_up(DOWN_PROBE_TIMEOUT) {
                return true;
            }
            if let Some(old) = old_boot_id {
                match self.boot_id() {
                    Ok(current) if current != old => return true,
                    Ok(_) => {},
                    Err(_) => return true,
                }
            }
            if self.clock.since(start) >= timeout {
                return false;
            }
            self.clock.sleep(LIVENESS_POLL_INTERVAL);
        }
    }

    fn get_file(&self, remote_path: &str, local_path: &Path) -> Result<(), HostError> {
        let mut cmd = Command::new("scp");
        cmd.arg("-q")
            .args(ssh_options(&self.config))
            .arg("-P")
            .arg(self.config.port.to_string())
            .arg(format!(
                "{}@{}:{}",
                self.config.user, self.hostname, remote_path
            ))
            .arg(local_path);
        run_command(&mut cmd, None)?.check().map(|_| ())
    }
}

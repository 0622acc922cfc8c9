//! Transport sessions to a device under test.
//!
//! [`Transport`] is the blocking command channel every other component uses
//! to reach the DUT. [`SshTransport`] implements it with the system `ssh`
//! and `scp` binaries.

mod ssh;

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

pub use self::ssh::{SshTransport, ssh_base_args};
use crate::error::HostError;
pub use crate::process::CommandResult;

/// Command that reboots a ChromeOS device without waiting on the session.
///
/// The delayed `reboot -f` covers a wedged userspace that ignores a clean
/// reboot request.
pub const REBOOT_COMMAND: &str =
    "((reboot & sleep 10; reboot -f &) </dev/null >/dev/null 2>&1 &)";

/// Per-boot unique identifier, used to tell a fresh boot from the old one.
pub const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Options for a single remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Kill the command after this long.
    pub timeout: Option<Duration>,
    /// Return a non-zero exit as a result instead of an error.
    pub ignore_status: bool,
}

impl RunOptions {
    /// Default options: no timeout, non-zero exit is an error.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: None,
            ignore_status: false,
        }
    }

    /// Sets the command timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Accepts a non-zero exit status.
    #[must_use]
    pub const fn ignore_status(mut self) -> Self {
        self.ignore_status = true;
        self
    }
}

/// A synchronous command channel to a host.
pub trait Transport: Send {
    /// Hostname of the device this session targets.
    fn hostname(&self) -> &str;

    /// Runs a shell command on the host.
    ///
    /// Unless `options.ignore_status` is set, a non-zero exit is returned as
    /// [`HostError::CommandFailed`].
    fn run_with(&self, command: &str, options: &RunOptions) -> Result<CommandResult, HostError>;

    /// Returns true if a trivial command succeeds within `timeout`.
    fn is_up(&self, timeout: Duration) -> bool;

    /// Waits until the host accepts commands. Returns false on timeout.
    fn wait_up(&self, timeout: Duration) -> bool;

    /// Waits until the host stops accepting commands or its boot id differs
    /// from `old_boot_id`. Returns false on timeout.
    fn wait_down(&self, timeout: Duration, old_boot_id: Option<&str>) -> bool;

    /// Copies a file from the host.
    fn get_file(&self, remote_path: &str, local_path: &Path) -> Result<(), HostError>;

    /// Runs a command with default options.
    fn run(&self, command: &str) -> Result<CommandResult, HostError> {
        self.run_with(command, &RunOptions::new())
    }

    /// Reads the current boot id.
    fn boot_id(&self) -> Result<String, HostError> {
        let result = self.run_with(
            &format!("cat {BOOT_ID_PATH}"),
            &RunOptions::new().timeout(Duration::from_secs(60)),
        )?;
        Ok(result.stdout_trimmed().to_string())
    }

    /// Reboots the host and waits for it to come back.
    fn reboot(&self, timeout: Duration) -> Result<(), HostError> {
        let old_boot_id = match self.boot_id() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(hostname = %self.hostname(), error = %e, "could not read boot id before reboot");
                None
            },
        };

        info!(hostname = %self.hostname(), "rebooting");
        self.run_with(
            REBOOT_COMMAND,
            &RunOptions::new()
                .timeout(Duration::from_secs(10))
                .ignore_status(),
        )?;

        if !self.wait_down(timeout, old_boot_id.as_deref()) {
            return Err(HostError::timeout(
                format!("{} to go down for reboot", self.hostname()),
                timeout,
            ));
        }
        if !self.wait_up(timeout) {
            return Err(HostError::timeout(
                format!("{} to come back up after reboot", self.hostname()),
                timeout,
            ));
        }
        Ok(())
    }
}

/// Quotes a value for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

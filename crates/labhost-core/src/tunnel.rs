//! SSH port-forward tunnels to RPC services on a DUT.
//!
//! The [`TunnelManager`] maps each remote service port to exactly one local
//! forwarding process. Establishing a tunnel for a port that already has one
//! first tears the old one down, including the remote server process it was
//! started for.
//!
//! # Invariants
//!
//! - At most one [`TunnelEntry`] exists per remote port.
//! - A removed entry's forwarder has been terminated, or had already exited.
//! - `disconnect` of an untracked port does nothing.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::clock::{Clock, SystemClock};
use crate::config::SshConfig;
use crate::error::HostError;
use crate::transport::{RunOptions, Transport, shell_quote, ssh_base_args};

/// How long a forwarder gets to exit after SIGTERM before it is killed.
const FORWARDER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default budget for confirming that a remote RPC server exited.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default pause between remote process-list checks.
pub const DEFAULT_SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Local URL an RPC client uses to reach a forwarded port.
#[must_use]
pub fn proxy_url(local_port: u16) -> String {
    format!("http://localhost:{local_port}")
}

/// Picks a currently unused local TCP port.
pub fn unused_local_port() -> Result<u16, HostError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| HostError::io("allocating a local port", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| HostError::io("allocating a local port", e))?
        .port();
    Ok(port)
}

/// A running local forwarding process.
pub trait Forwarder: Send + fmt::Debug {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking check for exit.
    fn has_exited(&mut self) -> std::io::Result<bool>;

    /// Stops the forwarder and reaps it.
    fn terminate(&mut self) -> std::io::Result<()>;
}

impl Forwarder for Child {
    fn pid(&self) -> Option<u32> {
        Some(self.id())
    }

    fn has_exited(&mut self) -> std::io::Result<bool> {
        Ok(Child::try_wait(self)?.is_some())
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        let target = Pid::from_raw(self.id() as i32);
        if let Err(e) = kill(target, Signal::SIGTERM) {
            debug!(pid = self.id(), error = %e, "SIGTERM failed, killing");
            Child::kill(self)?;
        }
        if self.wait_timeout(FORWARDER_EXIT_TIMEOUT)?.is_none() {
            warn!(pid = self.id(), "forwarder ignored SIGTERM, killing");
            Child::kill(self)?;
            Child::wait(self)?;
        }
        Ok(())
    }
}

/// Starts forwarding processes.
pub trait TunnelLauncher: Send {
    /// Forwards `localhost:local_port` to port `remote_port` on `hostname`.
    fn launch(
        &self,
        hostname: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Forwarder>, HostError>;
}

/// Launches `ssh -n -N -q -L local:localhost:remote` forwarders.
#[derive(Debug, Clone, Default)]
pub struct SshTunnelLauncher {
    config: SshConfig,
}

impl SshTunnelLauncher {
    /// Creates a launcher using the given SSH options.
    #[must_use]
    pub const fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

impl TunnelLauncher for SshTunnelLauncher {
    fn launch(
        &self,
        hostname: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Forwarder>, HostError> {
        let child = Command::new("ssh")
            .args(ssh_base_args(&self.config))
            .args(["-n", "-N", "-q", "-L"])
            .arg(format!("{local_port}:localhost:{remote_port}"))
            .arg(hostname)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HostError::io("spawning ssh tunnel", e))?;
        Ok(Box::new(child))
    }
}

/// One forwarded RPC port.
#[derive(Debug)]
pub struct TunnelEntry {
    /// Pattern matching the remote server in `pkill -f`/`pgrep -f`.
    pub process_match_name: Option<String>,
    /// Remote server pid printed at launch.
    pub remote_pid: Option<u32>,
    /// Local end of the forward.
    pub local_port: u16,
    forwarder: Box<dyn Forwarder>,
}

impl TunnelEntry {
    /// Local process id of the forwarder.
    #[must_use]
    pub fn forwarder_pid(&self) -> Option<u32> {
        self.forwarder.pid()
    }
}

/// Owns the per-host map of remote port to tunnel.
pub struct TunnelManager {
    launcher: Box<dyn TunnelLauncher>,
    clock: Arc<dyn Clock>,
    shutdown_timeout: Duration,
    poll_interval: Duration,
    tunnels: BTreeMap<u16, TunnelEntry>,
}

impl fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelManager")
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("tunnels", &self.tunnels)
            .finish_non_exhaustive()
    }
}

impl TunnelManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(launcher: Box<dyn TunnelLauncher>) -> Self {
        Self {
            launcher,
            clock: Arc::new(SystemClock),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            poll_interval: DEFAULT_SHUTDOWN_POLL_INTERVAL,
            tunnels: BTreeMap::new(),
        }
    }

    /// Uses `clock` for remote shutdown polling.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the remote shutdown budget and poll interval.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the entry for a remote port.
    #[must_use]
    pub fn get(&self, port: u16) -> Option<&TunnelEntry> {
        self.tunnels.get(&port)
    }

    /// Returns true if `port` has a tunnel.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.tunnels.contains_key(&port)
    }

    /// Tracked remote ports, ascending.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.tunnels.keys().copied()
    }

    /// Number of tracked tunnels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Returns true if no tunnels are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Forwards a fresh local port to `port` on the host and returns its URL.
    ///
    /// Any existing tunnel on `port` is disconnected first; if that fails the
    /// error is returned and nothing new is spawned.
    pub fn setup(
        &mut self,
        transport: &dyn Transport,
        port: u16,
        process_match_name: Option<&str>,
        remote_pid: Option<u32>,
    ) -> Result<String, HostError> {
        self.disconnect(transport, port)?;

        let local_port = unused_local_port()?;
        let forwarder = self
            .launcher
            .launch(transport.hostname(), local_port, port)?;
        info!(
            hostname = %transport.hostname(),
            port,
            local_port,
            forwarder_pid = ?forwarder.pid(),
            "established rpc tunnel"
        );

        self.tunnels.insert(
            port,
            TunnelEntry {
                process_match_name: process_match_name.map(str::to_string),
                remote_pid,
                local_port,
                forwarder,
            },
        );
        Ok(proxy_url(local_port))
    }

    /// Tears down the tunnel for `port`, stopping its remote server first.
    ///
    /// The entry is removed and its forwarder stopped even when the remote
    /// server cannot be confirmed gone; that failure is still returned.
    pub fn disconnect(&mut self, transport: &dyn Transport, port: u16) -> Result<(), HostError> {
        let Some(mut entry) = self.tunnels.remove(&port) else {
            return Ok(());
        };

        let remote = self.stop_remote_server(transport, &entry);
        Self::stop_forwarder(port, &mut entry);
        remote
    }

    /// Disconnects every tunnel, returning the first error encountered.
    pub fn disconnect_all(&mut self, transport: &dyn Transport) -> Result<(), HostError> {
        let ports: Vec<u16> = self.ports().collect();
        let mut first_error = None;
        for port in ports {
            if let Err(e) = self.disconnect(transport, port) {
                warn!(hostname = %transport.hostname(), port, error = %e, "failed to disconnect rpc tunnel");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn stop_remote_server(
        &self,
        transport: &dyn Transport,
        entry: &TunnelEntry,
    ) -> Result<(), HostError> {
        let Some(name) = entry.process_match_name.as_deref() else {
            return Ok(());
        };

        // pkill exits 1 when nothing matched.
        let quoted = shell_quote(name);
        transport.run_with(&format!("pkill -f {quoted}"), &RunOptions::new().ignore_status())?;

        let Some(remote_pid) = entry.remote_pid else {
            return Ok(());
        };
        info!(hostname = %transport.hostname(), name, remote_pid, "waiting for rpc server shutdown");

        let pid = remote_pid.to_string();
        let start = self.clock.now();
        while self.clock.since(start) < self.shutdown_timeout {
            let running = transport.run_with(&format!("pgrep -f {quoted}"), &RunOptions::new().ignore_status())?;
            if !running.stdout.split_whitespace().any(|p| p == pid) {
                info!(hostname = %transport.hostname(), name, "rpc server shut down");
                return Ok(());
            }
            self.clock.sleep(self.poll_interval);
        }

        Err(HostError::timeout(
            format!("rpc server {name} (pid {remote_pid}) to shut down"),
            self.shutdown_timeout,
        ))
    }

    fn stop_forwarder(port: u16, entry: &mut TunnelEntry) {
        match entry.forwarder.has_exited() {
            Ok(true) => {
                debug!(port, "tunnel already exited");
            },
            Ok(false) | Err(_) => {
                if let Err(e) = entry.forwarder.terminate() {
                    warn!(port, error = %e, "failed to terminate tunnel");
                } else {
                    debug!(port, pid = ?entry.forwarder.pid(), "terminated tunnel");
                }
            },
        }
    }
}

//! Starting RPC servers on a DUT and connecting to them through a tunnel.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{DEFAULT_REQUEST_TIMEOUT, RpcError, RpcProxy};
use crate::clock::Clock;
use crate::error::HostError;
use crate::retry::{BackoffConfig, RetryDecision, RetryPolicy};
use crate::transport::{Transport, shell_quote};
use crate::tunnel::TunnelManager;

/// Default readiness budget.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default destination for the server's output on the host.
pub const DEFAULT_LOGFILE: &str = "/dev/null";

/// How to start a remote RPC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcLaunch {
    /// Shell command that runs the server in the foreground.
    pub command: String,
    /// Port the server listens on, on the host.
    pub port: u16,
    /// Pattern used to `pkill`/`pgrep` the server on disconnect.
    pub process_match_name: Option<String>,
    /// Zero-argument method that succeeds once the server is ready.
    pub readiness_probe: Option<String>,
    /// Bound on the total readiness wait.
    pub timeout: Duration,
    /// Remote file receiving the server's stdout and stderr.
    pub logfile: String,
}

impl RpcLaunch {
    /// A launch with default timeout and logfile, and no probe.
    #[must_use]
    pub fn new(command: impl Into<String>, port: u16) -> Self {
        Self {
            command: command.into(),
            port,
            process_match_name: None,
            readiness_probe: None,
            timeout: DEFAULT_READY_TIMEOUT,
            logfile: DEFAULT_LOGFILE.to_string(),
        }
    }

    /// Sets the `pkill -f` pattern.
    #[must_use]
    pub fn process_match_name(mut self, name: impl Into<String>) -> Self {
        self.process_match_name = Some(name.into());
        self
    }

    /// Waits for `method` to succeed before returning the proxy.
    #[must_use]
    pub fn readiness_probe(mut self, method: impl Into<String>) -> Self {
        self.readiness_probe = Some(method.into());
        self
    }

    /// Sets the readiness budget.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the remote logfile.
    #[must_use]
    pub fn logfile(mut self, logfile: impl Into<String>) -> Self {
        self.logfile = logfile.into();
        self
    }

    /// The detached launch line. Output must be redirected or ssh would wait
    /// for the background server to close its descriptors.
    #[must_use]
    pub fn remote_command(&self) -> String {
        format!(
            "{} </dev/null >{} 2>&1 & echo $!",
            self.command,
            shell_quote(&self.logfile)
        )
    }

    /// Readiness retry schedule: exponential, starting at a twentieth of the
    /// budget clamped to 100ms..=1s, never waiting past the budget.
    #[must_use]
    pub fn readiness_policy(&self) -> RetryPolicy {
        let initial_delay = (self.timeout / 20).clamp(Duration::from_millis(100), Duration::from_secs(1));
        RetryPolicy::deadline(self.timeout).with_backoff(BackoffConfig::Exponential {
            initial_delay,
            max_delay: initial_delay * 8,
            multiplier: 2.0,
        })
    }
}

fn parse_remote_pid(stdout: &str) -> Option<u32> {
    stdout.lines().rev().find_map(|line| line.trim().parse().ok())
}

/// Starts `launch.command` on the host and returns a proxy to it.
///
/// Any tunnel on `launch.port` is torn down first. The launch itself is not
/// retried; only the readiness probe is. When the probe does not succeed
/// within `launch.timeout` the tunnel is torn down and
/// [`HostError::Infra`] is returned.
pub fn connect(
    transport: &dyn Transport,
    tunnels: &mut TunnelManager,
    clock: &dyn Clock,
    launch: &RpcLaunch,
) -> Result<RpcProxy, HostError> {
    tunnels.disconnect(transport, launch.port)?;

    let launched = transport.run(&launch.remote_command())?;
    let remote_pid = parse_remote_pid(&launched.stdout);
    if remote_pid.is_none() {
        warn!(
            hostname = %transport.hostname(),
            output = %launched.stdout.trim(),
            "could not read rpc server pid"
        );
    }
    debug!(hostname = %transport.hostname(), ?remote_pid, "started rpc server");

    let url = tunnels.setup(
        transport,
        launch.port,
        launch.process_match_name.as_deref(),
        remote_pid,
    )?;
    let proxy = RpcProxy::new(url)?;

    let Some(probe) = launch.readiness_probe.as_deref() else {
        return Ok(proxy);
    };

    info!(
        hostname = %transport.hostname(),
        timeout_secs = launch.timeout.as_secs_f64(),
        "waiting for rpc server to start"
    );
    // Each probe is bounded by what remains of the readiness budget.
    let start = clock.now();
    let ready = launch.readiness_policy().run(
        clock,
        |_| {
            let remaining = launch.timeout.saturating_sub(clock.since(start));
            if remaining.is_zero() {
                return Err(RpcError::Timeout {
                    url: proxy.url().to_string(),
                });
            }
            RpcProxy::with_timeout(proxy.url(), remaining.min(DEFAULT_REQUEST_TIMEOUT))?
                .call0(probe)
        },
        |e: &RpcError| {
            if e.is_retryable() || matches!(e, RpcError::Timeout { .. }) {
                RetryDecision::Retry
            } else {
                RetryDecision::Abort
            }
        },
    );

    match ready {
        Ok(_) => {
            info!(hostname = %transport.hostname(), port = launch.port, "rpc server started");
            Ok(proxy)
        },
        Err(e) => {
            let last = e.into_inner();
            error!(hostname = %transport.hostname(), error = %last, "failed to start rpc server");
            if let Err(disconnect) = tunnels.disconnect(transport, launch.port) {
                warn!(error = %disconnect, "failed to clean up after rpc start failure");
            }
            Err(HostError::infra(format!(
                "failed to start RPC server `{}`: {last}",
                launch.command
            )))
        },
    }
}

/// Tunnels to an RPC server already running on `port` and returns a proxy.
pub fn jsonrpc_connect(
    transport: &dyn Transport,
    tunnels: &mut TunnelManager,
    port: u16,
) -> Result<RpcProxy, HostError> {
    let url = tunnels.setup(transport, port, None, None)?;
    info!(hostname = %transport.hostname(), port, "established a jsonrpc connection");
    Ok(RpcProxy::new(url)?)
}

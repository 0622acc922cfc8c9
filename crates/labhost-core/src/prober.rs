//! Ping-level reachability polling.
//!
//! This is deliberately cheaper than [`Transport::is_up`]: a host that answers
//! ping may still refuse ssh. Callers that only need "the network stack is
//! alive" use the [`Prober`]; callers that need to run commands wait on the
//! transport.
//!
//! [`Transport::is_up`]: crate::transport::Transport::is_up

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::process::run_command;

/// Number of polls a wait is spread over.
pub const PING_WAIT_COUNT: u64 = 40;

/// Ceiling on the poll interval, before the one-second probe allowance.
pub const MAX_POLL_INTERVAL_SECS: u64 = 60;

/// Deadline for a single probe.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(1);

/// A single reachability probe.
pub trait Pinger: Send + Sync {
    /// Returns true if `hostname` answered within `deadline`.
    fn ping(&self, hostname: &str, deadline: Duration) -> bool;
}

/// Probes with `ping -c 1 -w <deadline>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPinger;

impl Pinger for SystemPinger {
    fn ping(&self, hostname: &str, deadline: Duration) -> bool {
        let mut cmd = Command::new("ping");
        cmd.args(["-c", "1", "-w"])
            .arg(deadline.as_secs().max(1).to_string())
            .arg(hostname);
        run_command(&mut cmd, Some(deadline + Duration::from_secs(5)))
            .is_ok_and(|result| result.success())
    }
}

/// Sleep between polls for a wait of `timeout`.
///
/// Roughly [`PING_WAIT_COUNT`] polls per wait, capped at a minute, less the
/// second each probe itself takes. Zero means poll back to back.
#[must_use]
pub const fn poll_interval(timeout: Duration) -> Duration {
    let mut secs = timeout.as_secs() / PING_WAIT_COUNT;
    if secs > MAX_POLL_INTERVAL_SECS {
        secs = MAX_POLL_INTERVAL_SECS;
    }
    Duration::from_secs(secs.saturating_sub(1))
}

/// Polls a host's ping status.
#[derive(Clone)]
pub struct Prober {
    pinger: Arc<dyn Pinger>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober").finish_non_exhaustive()
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new(Arc::new(SystemPinger), Arc::new(SystemClock))
    }
}

impl Prober {
    /// Creates a prober.
    #[must_use]
    pub fn new(pinger: Arc<dyn Pinger>, clock: Arc<dyn Clock>) -> Self {
        Self { pinger, clock }
    }

    fn check_status(&self, hostname: &str, target_up: bool) -> bool {
        self.pinger.ping(hostname, PROBE_DEADLINE) == target_up
    }

    /// Polls until `hostname`'s ping status equals `target_up` or `timeout`
    /// passes.
    ///
    /// A final probe runs after the loop, since the last poll may be a full
    /// interval old.
    pub fn wait_for_status(&self, hostname: &str, target_up: bool, timeout: Duration) -> bool {
        let interval = poll_interval(timeout);
        debug!(hostname, target_up, timeout_secs = timeout.as_secs(), interval_secs = interval.as_secs(), "waiting for ping status");

        let start = self.clock.now();
        while self.clock.since(start) <= timeout {
            if self.check_status(hostname, target_up) {
                return true;
            }
            if !interval.is_zero() {
                self.clock.sleep(interval);
            }
        }

        self.check_status(hostname, target_up)
    }

    /// Waits for the host to answer ping.
    pub fn ping_wait_up(&self, hostname: &str, timeout: Duration) -> bool {
        self.wait_for_status(hostname, true, timeout)
    }

    /// Waits for the host to stop answering ping.
    pub fn ping_wait_down(&self, hostname: &str, timeout: Duration) -> bool {
        self.wait_for_status(hostname, false, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    /// Answers up once the clock passes `up_at`; each probe takes its deadline.
    struct FlipPinger {
        clock: Arc<ManualClock>,
        up_at: Option<Duration>,
    }

    impl Pinger for FlipPinger {
        fn ping(&self, _: &str, deadline: Duration) -> bool {
            let up = self.up_at.is_some_and(|t| self.clock.elapsed() >= t);
            if !up {
                self.clock.advance(deadline);
            }
            up
        }
    }

    #[test]
    fn test_poll_interval() {
        assert_eq!(poll_interval(Duration::from_secs(40)), Duration::ZERO);
        assert_eq!(poll_interval(Duration::from_secs(79)), Duration::ZERO);
        assert_eq!(poll_interval(Duration::from_secs(480)), Duration::from_secs(11));
        assert_eq!(poll_interval(Duration::from_secs(3600)), Duration::from_secs(59));
    }

    #[test]
    fn test_wait_up_observes_flip() {
        let clock = Arc::new(ManualClock::new());
        let pinger = Arc::new(FlipPinger {
            clock: Arc::clone(&clock),
            up_at: Some(Duration::from_secs(100)),
        });
        let prober = Prober::new(pinger, clock.clone());
        let timeout = Duration::from_secs(480);

        assert!(prober.ping_wait_up("dut", timeout));
        assert!(clock.elapsed() <= Duration::from_secs(100) + poll_interval(timeout) + PROBE_DEADLINE);
    }

    #[test]
    fn test_wait_up_times_out() {
        let clock = Arc::new(ManualClock::new());
        let pinger = Arc::new(FlipPinger {
            clock: Arc::clone(&clock),
            up_at: None,
        });
        let prober = Prober::new(pinger, clock.clone());

        assert!(!prober.ping_wait_up("dut", Duration::from_secs(30)));
        assert!(clock.elapsed() >= Duration::from_secs(30));
    }

    #[test]
    fn test_wait_down_when_unreachable() {
        let clock = Arc::new(ManualClock::new());
        let pinger = Arc::new(FlipPinger {
            clock: Arc::clone(&clock),
            up_at: None,
        });
        let prober = Prober::new(pinger, clock);

        assert!(prober.ping_wait_down("dut", Duration::from_secs(30)));
    }
}

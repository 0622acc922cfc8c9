//! Remote power management (RPM) of lab hosts.
//!
//! Lab racks put each DUT behind a networked power outlet. The RPM frontend
//! queues outlet changes by hostname; [`RpmClient`] submits them over
//! JSON-RPC.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tracing::info;

use crate::error::HostError;
use crate::rpc::RpcProxy;

/// Budget for one outlet change, including the frontend's queueing.
pub const DEFAULT_POWER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Host attribute set while the outlet was switched by the lab, cleared once
/// the outlet is back on.
pub const OUTLET_CHANGED_ATTRIBUTE: &str = "outlet_changed";

/// Requested outlet state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Outlet on.
    On,
    /// Outlet off.
    Off,
    /// Off, then on again.
    Cycle,
}

impl PowerState {
    /// Wire name understood by the RPM frontend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Cycle => "CYCLE",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Changes a host's outlet.
pub trait PowerManager: Send + Sync {
    /// Sets the outlet of `hostname` and waits for the change to be applied.
    fn set_power(&self, hostname: &str, state: PowerState) -> Result<(), HostError>;
}

/// Returns true if `hostname` names an RPM-controlled host.
///
/// Only the first dotted component is matched, so both short and fully
/// qualified names work.
#[must_use]
pub fn supports_rpm(hostname: &str, hostname_regex: &Regex) -> bool {
    let short = hostname.split('.').next().unwrap_or(hostname);
    hostname_regex.is_match(short)
}

/// RPM frontend reached over JSON-RPC.
#[derive(Debug)]
pub struct RpmClient {
    proxy: RpcProxy,
}

impl RpmClient {
    /// Creates a client for the frontend at `url`.
    pub fn new(url: impl Into<String>) -> Result<Self, HostError> {
        Ok(Self {
            proxy: RpcProxy::with_timeout(url, DEFAULT_POWER_TIMEOUT)?,
        })
    }
}

impl PowerManager for RpmClient {
    fn set_power(&self, hostname: &str, state: PowerState) -> Result<(), HostError> {
        info!(hostname, state = %state, "requesting outlet change");
        let accepted = self
            .proxy
            .call("queue_request", json!([hostname, state.as_str()]))?;
        if accepted.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(HostError::infra(format!(
                "RPM frontend failed to set {hostname} to {state}"
            )))
        }
    }
}

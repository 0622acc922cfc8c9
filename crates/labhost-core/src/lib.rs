//! # labhost-core
//!
//! Host management for ChromeOS devices under test in a lab.
//!
//! A [`CrosHost`] bundles everything the lab knows how to do to a device:
//!
//! - Run commands over ssh via a [`Transport`]
//! - Tunnel to RPC servers on the device through a [`TunnelManager`], and
//!   bootstrap those servers with [`rpc::connect`]
//! - Probe reachability with ICMP via the [`Prober`]
//! - Install images with [`CrosHost::machine_install`], taking the stateful
//!   fast path when the device already runs the requested build
//! - Repair a broken device with [`CrosHost::repair_full`], walking
//!   [`RepairAction::ESCALATION`] until the device passes its health check,
//!   counting each action's outcome in a [`MetricsRegistry`]
//!
//! ## Example
//!
//! ```no_run
//! use labhost_core::{CrosHost, LabConfig};
//!
//! # fn main() -> Result<(), labhost_core::HostError> {
//! let config = LabConfig::default();
//! let mut host = CrosHost::builder("chromeos1-row1-rack1-host1")
//!     .config(config)
//!     .build()?;
//!
//! let report = host.repair_full()?;
//! println!("repaired by {:?}", report.succeeded_action());
//! # Ok(())
//! # }
//! ```
//!
//! ## Collaborators
//!
//! Every external system sits behind a trait so it can be replaced in tests:
//! [`Inventory`] for labels and attributes, [`ImageServerPool`] for
//! devservers, [`UpdaterFactory`] for the on-device update engine, [`Servo`]
//! and [`PowerManager`] for out-of-band control, and [`Clock`] for every wait.

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod devserver;
pub mod error;
pub mod firmware;
pub mod host;
pub mod inventory;
pub mod labels;
pub mod metrics;
pub mod process;
pub mod prober;
pub mod repair;
pub mod retry;
pub mod rpc;
pub mod rpm;
pub mod servo;
pub mod transport;
pub mod tunnel;
pub mod update;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, LabConfig};
pub use devserver::{DevServer, DevServerPool, ImageServer, ImageServerPool};
pub use error::{HostError, RepairFailure};
pub use firmware::{ArtifactFetcher, HttpFetcher};
pub use host::{CrosHost, CrosHostBuilder};
pub use inventory::{AfeClient, InMemoryInventory, Inventory, StableVersionSource};
pub use metrics::{MetricsError, MetricsRegistry, RepairMetrics};
pub use prober::{Pinger, Prober, SystemPinger};
pub use repair::{OutcomeKind, RepairAction, RepairController, RepairOutcome, RepairReport, Repairable};
pub use rpc::{RpcError, RpcLaunch, RpcProxy};
pub use rpm::{PowerManager, PowerState, RpmClient};
pub use servo::{DutControlServo, Servo, UsbKeyState};
pub use transport::{CommandResult, RunOptions, SshTransport, Transport};
pub use tunnel::{Forwarder, SshTunnelLauncher, TunnelLauncher, TunnelManager};
pub use update::{InstallOutcome, InstallRequest, UpdateOrchestrator, Updater, UpdaterFactory};

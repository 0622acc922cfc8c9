//! A ChromeOS device under test.
//!
//! [`CrosHost`] composes a transport session, its RPC tunnels and the lab
//! services it depends on. Optional hardware (servo, RPM outlet, Chameleon)
//! is fixed at construction; operations that need missing hardware return
//! [`HostError::NotApplicable`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::LabConfig;
use crate::devserver::{DevServerPool, ImageServerPool};
use crate::error::HostError;
use crate::firmware::{ArtifactFetcher, FirmwareInstall, HttpFetcher};
use crate::inventory::{
    AfeClient, InMemoryInventory, Inventory, StableVersionSource, VERSION_PREFIX,
};
use crate::labels::{LABEL_DETECTORS, LabelContext, detect_labels};
use crate::metrics::MetricsRegistry;
use crate::prober::{Pinger, Prober, SystemPinger};
use crate::repair::{RepairAction, RepairController, RepairReport, Repairable};
use crate::rpc::{self, RpcLaunch, RpcProxy};
use crate::rpm::{OUTLET_CHANGED_ATTRIBUTE, PowerManager, PowerState, RpmClient, supports_rpm};
use crate::servo::{DutControlServo, Servo, UsbKeyState};
use crate::transport::{RunOptions, SshTransport, Transport};
use crate::tunnel::{SshTunnelLauncher, TunnelLauncher, TunnelManager};
use crate::update::image::version_match;
use crate::update::{
    ChromiumOsUpdaterFactory, InstallOutcome, InstallRequest, UpdateOrchestrator, UpdaterFactory,
    lsb_release_value,
};

/// Marker that pauses log cleanup on the host; removed on every cleanup.
pub const CLEANUP_LOGS_PAUSED_FILE: &str = "/var/lib/cleanup_logs_paused";

/// Present only on factory images.
pub const FACTORY_IMAGE_MARKER: &str = "/root/.factory_test";

/// File whose contents request a powerwash on the next boot.
pub const POWERWASH_REQUEST_FILE: &str = "/mnt/stateful_partition/factory_install_reset";

/// Partition whose free space `verify` checks.
pub const STATEFUL_PARTITION: &str = "/mnt/stateful_partition";

/// Free space `verify` requires on the stateful partition, in GB.
pub const MIN_STATEFUL_FREE_GB: f64 = 20.0;

/// Budget for the ssh liveness check in `check_device`.
const SSH_PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds a [`CrosHost`]. Unset collaborators get lab defaults derived from
/// the config.
pub struct CrosHostBuilder {
    hostname: String,
    config: LabConfig,
    transport: Option<Box<dyn Transport>>,
    tunnel_launcher: Option<Box<dyn TunnelLauncher>>,
    pinger: Option<Arc<dyn Pinger>>,
    inventory: Option<Arc<dyn Inventory>>,
    stable_versions: Option<Arc<dyn StableVersionSource>>,
    devservers: Option<Arc<dyn ImageServerPool>>,
    updaters: Option<Arc<dyn UpdaterFactory>>,
    servo: Option<Box<dyn Servo>>,
    power: Option<Box<dyn PowerManager>>,
    chameleon: Option<String>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    metrics: Option<MetricsRegistry>,
    clock: Option<Arc<dyn Clock>>,
}

impl fmt::Debug for CrosHostBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrosHostBuilder")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

impl CrosHostBuilder {
    /// Starts a builder for `hostname`.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            config: LabConfig::default(),
            transport: None,
            tunnel_launcher: None,
            pinger: None,
            inventory: None,
            stable_versions: None,
            devservers: None,
            updaters: None,
            servo: None,
            power: None,
            chameleon: None,
            fetcher: None,
            metrics: None,
            clock: None,
        }
    }

    /// Sets the lab configuration.
    #[must_use]
    pub fn config(mut self, config: LabConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the transport session.
    #[must_use]
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets how tunnel forwarders are started.
    #[must_use]
    pub fn tunnel_launcher(mut self, launcher: Box<dyn TunnelLauncher>) -> Self {
        self.tunnel_launcher = Some(launcher);
        self
    }

    /// Sets the ping prober's probe.
    #[must_use]
    pub fn pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = Some(pinger);
        self
    }

    /// Sets the inventory.
    #[must_use]
    pub fn inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Sets the stable version lookup.
    #[must_use]
    pub fn stable_versions(mut self, stable_versions: Arc<dyn StableVersionSource>) -> Self {
        self.stable_versions = Some(stable_versions);
        self
    }

    /// Sets the devserver pool.
    #[must_use]
    pub fn devservers(mut self, devservers: Arc<dyn ImageServerPool>) -> Self {
        self.devservers = Some(devservers);
        self
    }

    /// Sets the updater factory.
    #[must_use]
    pub fn updaters(mut self, updaters: Arc<dyn UpdaterFactory>) -> Self {
        self.updaters = Some(updaters);
        self
    }

    /// Attaches a servo.
    #[must_use]
    pub fn servo(mut self, servo: Box<dyn Servo>) -> Self {
        self.servo = Some(servo);
        self
    }

    /// Puts the host behind a power manager.
    #[must_use]
    pub fn power_manager(mut self, power: Box<dyn PowerManager>) -> Self {
        self.power = Some(power);
        self
    }

    /// Attaches a Chameleon board with the given label.
    #[must_use]
    pub fn chameleon(mut self, label: impl Into<String>) -> Self {
        self.chameleon = Some(label.into());
        self
    }

    /// Sets the artifact fetcher used by firmware installs.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets the registry repair outcomes are counted in. Clones of a
    /// registry share counters, so one registry can serve many hosts.
    #[must_use]
    pub fn metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the clock every wait uses.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the host. Performs no I/O against the host itself.
    pub fn build(self) -> Result<CrosHost, HostError> {
        let config = self.config;
        let hostname = self.hostname;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let transport = match self.transport {
            Some(transport) => transport,
            None => Box::new(
                SshTransport::new(hostname.clone(), config.ssh.clone())
                    .with_clock(Arc::clone(&clock)),
            ),
        };
        let launcher = self
            .tunnel_launcher
            .unwrap_or_else(|| Box::new(SshTunnelLauncher::new(config.ssh.clone())));
        let tunnels = TunnelManager::new(launcher)
            .with_clock(Arc::clone(&clock))
            .with_shutdown_timeout(
                config.timeouts.rpc_shutdown,
                config.timeouts.rpc_shutdown_poll_interval,
            );
        let pinger = self.pinger.unwrap_or_else(|| Arc::new(SystemPinger));
        let prober = Prober::new(pinger, Arc::clone(&clock));

        let (inventory, stable_versions) = match (self.inventory, self.stable_versions) {
            (Some(inventory), Some(stable_versions)) => (inventory, stable_versions),
            (inventory, stable_versions) => {
                let (default_inventory, default_versions) = default_inventory(&config)?;
                (
                    inventory.unwrap_or(default_inventory),
                    stable_versions.unwrap_or(default_versions),
                )
            },
        };

        let devservers = match self.devservers {
            Some(devservers) => devservers,
            None => Arc::new(DevServerPool::new(config.devservers.urls.clone())?),
        };

        let servo = self.servo.or_else(|| {
            config.servo.host.as_ref().map(|servo_host| {
                Box::new(DutControlServo::new(
                    config.servo.dut_control.clone(),
                    Some(servo_host.clone()),
                    config.servo.port,
                )) as Box<dyn Servo>
            })
        });

        let power = match self.power {
            Some(power) => Some(power),
            None => default_power_manager(&hostname, &config)?,
        };

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => MetricsRegistry::new()
                .map_err(|e| HostError::infra(format!("failed to create metrics registry: {e}")))?,
        };

        Ok(CrosHost {
            hostname,
            transport,
            tunnels,
            prober,
            inventory,
            stable_versions,
            devservers,
            updaters: self
                .updaters
                .unwrap_or_else(|| Arc::new(ChromiumOsUpdaterFactory)),
            servo,
            power,
            chameleon: self.chameleon,
            fetcher: self
                .fetcher
                .unwrap_or_else(|| Arc::new(HttpFetcher::default())),
            metrics,
            clock,
            config,
        })
    }
}

type InventoryPair = (Arc<dyn Inventory>, Arc<dyn StableVersionSource>);

fn default_inventory(config: &LabConfig) -> Result<InventoryPair, HostError> {
    if let Some(url) = &config.afe.url {
        let afe = Arc::new(AfeClient::new(url.clone())?);
        let inventory: Arc<dyn Inventory> = afe.clone();
        let stable_versions: Arc<dyn StableVersionSource> = afe;
        Ok((inventory, stable_versions))
    } else {
        let local = Arc::new(InMemoryInventory::new());
        let inventory: Arc<dyn Inventory> = local.clone();
        let stable_versions: Arc<dyn StableVersionSource> = local;
        Ok((inventory, stable_versions))
    }
}

fn default_power_manager(
    hostname: &str,
    config: &LabConfig,
) -> Result<Option<Box<dyn PowerManager>>, HostError> {
    let Some(url) = &config.rpm.url else {
        return Ok(None);
    };
    let regex = Regex::new(&config.rpm.hostname_regex)
        .map_err(|e| HostError::infra(format!("invalid rpm hostname regex: {e}")))?;
    if !supports_rpm(hostname, &regex) {
        return Ok(None);
    }
    Ok(Some(Box::new(RpmClient::new(url.clone())?)))
}

/// A ChromeOS device under test.
pub struct CrosHost {
    hostname: String,
    transport: Box<dyn Transport>,
    tunnels: TunnelManager,
    prober: Prober,
    inventory: Arc<dyn Inventory>,
    stable_versions: Arc<dyn StableVersionSource>,
    devservers: Arc<dyn ImageServerPool>,
    updaters: Arc<dyn UpdaterFactory>,
    servo: Option<Box<dyn Servo>>,
    power: Option<Box<dyn PowerManager>>,
    chameleon: Option<String>,
    fetcher: Arc<dyn ArtifactFetcher>,
    metrics: MetricsRegistry,
    clock: Arc<dyn Clock>,
    config: LabConfig,
}

impl fmt::Debug for CrosHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrosHost")
            .field("hostname", &self.hostname)
            .field("tunnels", &self.tunnels)
            .field("servo", &self.servo.is_some())
            .field("power", &self.power.is_some())
            .field("chameleon", &self.chameleon)
            .finish_non_exhaustive()
    }
}

impl CrosHost {
    /// Starts building a host.
    #[must_use]
    pub fn builder(hostname: impl Into<String>) -> CrosHostBuilder {
        CrosHostBuilder::new(hostname)
    }

    /// Hostname of the DUT.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The transport session.
    #[must_use]
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// The tunnels currently open to this host.
    #[must_use]
    pub const fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// The lab configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Whether a servo is attached.
    #[must_use]
    pub fn has_servo(&self) -> bool {
        self.servo.is_some()
    }

    /// Whether the host's power is remotely controllable.
    #[must_use]
    pub fn has_power(&self) -> bool {
        self.power.is_some()
    }

    // RPC

    /// Starts an RPC server on the host and returns a proxy to it.
    pub fn rpc_connect(&mut self, launch: &RpcLaunch) -> Result<RpcProxy, HostError> {
        rpc::connect(
            self.transport.as_ref(),
            &mut self.tunnels,
            self.clock.as_ref(),
            launch,
        )
    }

    /// Tunnels to an RPC server already listening on `port`.
    pub fn jsonrpc_connect(&mut self, port: u16) -> Result<RpcProxy, HostError> {
        rpc::jsonrpc_connect(self.transport.as_ref(), &mut self.tunnels, port)
    }

    /// Tears down the tunnel on `port` and its remote server.
    pub fn rpc_disconnect(&mut self, port: u16) -> Result<(), HostError> {
        self.tunnels.disconnect(self.transport.as_ref(), port)
    }

    /// Tears down every tunnel.
    pub fn rpc_disconnect_all(&mut self) -> Result<(), HostError> {
        self.tunnels.disconnect_all(self.transport.as_ref())
    }

    /// Releases every tunnel. The host can still be used afterwards.
    pub fn close(&mut self) -> Result<(), HostError> {
        self.rpc_disconnect_all()
    }

    // Reachability

    /// Waits for the host to answer ping.
    pub fn ping_wait_up(&self, timeout: Duration) -> bool {
        self.prober.ping_wait_up(&self.hostname, timeout)
    }

    /// Waits for the host to stop answering ping.
    pub fn ping_wait_down(&self, timeout: Duration) -> bool {
        self.prober.ping_wait_down(&self.hostname, timeout)
    }

    /// Whether the host accepts commands within `timeout`.
    pub fn is_up(&self, timeout: Duration) -> bool {
        self.transport.is_up(timeout)
    }

    /// Reboots the host and waits for it.
    pub fn reboot(&self, timeout: Duration) -> Result<(), HostError> {
        self.transport.reboot(timeout)
    }

    // Power

    fn set_power(&self, state: PowerState) -> Result<(), HostError> {
        let Some(power) = &self.power else {
            return Err(HostError::not_applicable(format!(
                "{} does not have RPM connected",
                self.hostname
            )));
        };
        self.inventory
            .set_attribute(&self.hostname, OUTLET_CHANGED_ATTRIBUTE, Some("True"))?;
        power.set_power(&self.hostname, state)
    }

    /// Turns the outlet off.
    pub fn power_off(&self) -> Result<(), HostError> {
        self.set_power(PowerState::Off)
    }

    /// Turns the outlet on.
    pub fn power_on(&self) -> Result<(), HostError> {
        self.set_power(PowerState::On)
    }

    /// Cycles the outlet.
    pub fn power_cycle(&self) -> Result<(), HostError> {
        self.set_power(PowerState::Cycle)
    }

    // Install

    fn orchestrator(&self) -> UpdateOrchestrator<'_> {
        UpdateOrchestrator {
            transport: self.transport.as_ref(),
            inventory: self.inventory.as_ref(),
            stable_versions: self.stable_versions.as_ref(),
            devservers: self.devservers.as_ref(),
            updaters: self.updaters.as_ref(),
            clock: self.clock.as_ref(),
            config: &self.config,
        }
    }

    /// Installs an image; see [`UpdateOrchestrator::machine_install`].
    pub fn machine_install(&self, request: &InstallRequest) -> Result<InstallOutcome, HostError> {
        self.orchestrator().machine_install(request)
    }

    /// The stable image for this host's board.
    pub fn repair_image_name(&self) -> Result<String, HostError> {
        self.orchestrator().repair_image_name()
    }

    fn require_servo(&self, what: &str) -> Result<&dyn Servo, HostError> {
        self.servo.as_deref().ok_or_else(|| {
            HostError::not_applicable(format!("{what}: {} has no servo support", self.hostname))
        })
    }

    /// Reinstalls the OS from the servo USB key.
    ///
    /// With `image_url` the image is first written to the key; otherwise the
    /// image already on it is booted.
    pub fn servo_install(&self, image_url: Option<&str>) -> Result<(), HostError> {
        let servo = self.require_servo("servo install")?;
        let timeouts = &self.config.timeouts;

        info!(
            hostname = %self.hostname,
            usb_boot_timeout_secs = timeouts.usb_boot.as_secs(),
            "booting from servo usb key"
        );
        servo.install_recovery_image(image_url)?;
        if !self.transport.wait_up(timeouts.usb_boot) {
            return Err(HostError::timeout(
                format!("{} to boot from USB", self.hostname),
                timeouts.usb_boot,
            ));
        }

        info!(hostname = %self.hostname, "resetting the TPM status");
        self.transport.run("chromeos-tpm-recovery")?;
        info!(hostname = %self.hostname, "installing image through chromeos-install");
        self.transport.run_with(
            "chromeos-install --yes",
            &RunOptions::new().timeout(timeouts.install),
        )?;
        if let Err(e) = self.transport.run_with(
            "halt",
            &RunOptions::new()
                .timeout(Duration::from_secs(30))
                .ignore_status(),
        ) {
            debug!(hostname = %self.hostname, error = %e, "session dropped by halt");
        }

        info!(hostname = %self.hostname, "power cycling DUT through servo");
        servo.power_off()?;
        servo.switch_usbkey(UsbKeyState::Off)?;
        servo.power_on()?;

        if !self.transport.wait_up(timeouts.boot) {
            return Err(HostError::timeout(
                format!("{} to boot the installed test image", self.hostname),
                timeouts.boot,
            ));
        }
        Ok(())
    }

    /// Wipes the stateful partition on the next boot and reboots into it.
    pub fn powerwash(&self) -> Result<(), HostError> {
        info!(hostname = %self.hostname, "powerwashing");
        self.transport
            .run(&format!("echo \"fast safe\" > {POWERWASH_REQUEST_FILE}"))?;
        let timeout = self.config.timeouts.powerwash_boot;
        self.transport.reboot(timeout)?;
        if !self.transport.is_up(self.config.timeouts.check_host_up) {
            error!(hostname = %self.hostname, "DUT did not come back after powerwash");
            return Err(HostError::timeout(
                format!("{} to boot from powerwash", self.hostname),
                timeout,
            ));
        }
        Ok(())
    }

    /// Flashes EC and AP firmware of `build` through the servo. Without a
    /// build the stable image's firmware is used.
    pub fn firmware_install(&self, build: Option<&str>) -> Result<(), HostError> {
        let servo = self.require_servo("firmware install")?;
        let build = match build {
            Some(build) => build.to_string(),
            None => self.repair_image_name()?,
        };
        FirmwareInstall {
            hostname: &self.hostname,
            servo,
            devservers: self.devservers.as_ref(),
            inventory: self.inventory.as_ref(),
            fetcher: self.fetcher.as_ref(),
            clock: self.clock.as_ref(),
        }
        .run(&build)
    }

    // Cleanup and verify

    fn is_factory_image(&self) -> Result<bool, HostError> {
        let result = self.transport.run_with(
            &format!("[ -f {FACTORY_IMAGE_MARKER} ]"),
            &RunOptions::new().ignore_status(),
        )?;
        Ok(result.success())
    }

    fn restart_ui(&self) -> Result<(), HostError> {
        if self.is_factory_image()? {
            return Err(HostError::not_applicable("cannot restart ui on factory images"));
        }
        self.transport.run("stop ui; start ui")?;
        Ok(())
    }

    fn cleanup_poweron(&self) -> Result<(), HostError> {
        if self
            .inventory
            .attribute(&self.hostname, OUTLET_CHANGED_ATTRIBUTE)?
            .is_none()
        {
            return Ok(());
        }
        debug!(hostname = %self.hostname, "host recently used the RPM, ensuring power is on");
        self.power_on()?;
        self.inventory
            .set_attribute(&self.hostname, OUTLET_CHANGED_ATTRIBUTE, None)
    }

    fn release_version(&self) -> Result<String, HostError> {
        let lsb_release = self.transport.run("cat /etc/lsb-release")?.stdout;
        Ok(lsb_release_value(&lsb_release, "CHROMEOS_RELEASE_VERSION")
            .unwrap_or_default()
            .to_string())
    }

    /// Removes `cros-version:` labels that do not match the running build.
    /// Any mismatch is an error.
    pub fn verify_cros_version_label(&self) -> Result<(), HostError> {
        let labels = self
            .inventory
            .labels_with_prefix(&self.hostname, VERSION_PREFIX)?;
        if labels.is_empty() {
            return Ok(());
        }

        let release_version = self.release_version()?;
        let mut mismatch = false;
        for label in labels {
            let build = &label[VERSION_PREFIX.len()..];
            if !version_match(build, &release_version) {
                warn!(
                    hostname = %self.hostname,
                    label = %label,
                    release_version = %release_version,
                    "cros-version label does not match release version, removing it"
                );
                self.inventory.remove_label(&self.hostname, &label)?;
                mismatch = true;
            }
        }
        if mismatch {
            return Err(HostError::verification("the host has wrong cros-version label"));
        }
        Ok(())
    }

    /// Resets per-test state on the host.
    ///
    /// Restarting the UI is preferred; when that is impossible the host is
    /// rebooted instead.
    pub fn cleanup(&self) -> Result<(), HostError> {
        self.transport
            .run(&format!("rm -f {CLEANUP_LOGS_PAUSED_FILE}"))?;
        if let Err(e) = self.restart_ui() {
            warn!(hostname = %self.hostname, error = %e, "unable to restart ui, rebooting device");
            self.transport.reboot(self.config.timeouts.reboot)?;
        }
        if self.has_power() {
            self.cleanup_poweron()?;
        }
        self.verify_cros_version_label()
    }

    fn stateful_free_gb(&self) -> Result<f64, HostError> {
        let df = self
            .transport
            .run(&format!("df -PB 1000000 {STATEFUL_PARTITION} | tail -1"))?;
        let free_mb: f64 = df
            .stdout
            .split_whitespace()
            .nth(3)
            .and_then(|field| field.parse().ok())
            .ok_or_else(|| {
                HostError::verification(format!("unreadable df output: {}", df.stdout_trimmed()))
            })?;
        Ok(free_mb / 1000.0)
    }

    /// Checks the host is fit to run tests.
    pub fn verify(&self) -> Result<(), HostError> {
        let free_gb = self.stateful_free_gb()?;
        if free_gb < MIN_STATEFUL_FREE_GB {
            return Err(HostError::verification(format!(
                "not enough free space on {STATEFUL_PARTITION}: {free_gb:.1}GB free, \
                 {MIN_STATEFUL_FREE_GB}GB required"
            )));
        }

        let services = self.transport.run_with(
            "status system-services | grep start/running",
            &RunOptions::new().ignore_status(),
        )?;
        if services.stdout_trimmed().is_empty() {
            return Err(HostError::verification(
                "Chrome failed to reach login. System services not running.",
            ));
        }

        // Factory images run goofy instead of update_engine.
        if !self.is_factory_image()? {
            self.transport.run("update_engine_client --status")?;
        }

        self.verify_cros_version_label()
    }

    /// Confirms the host answers over ssh, then cleans it up and verifies it.
    pub fn check_device(&self) -> Result<(), HostError> {
        self.transport
            .run_with("true", &RunOptions::new().timeout(SSH_PING_TIMEOUT))?;
        self.cleanup()?;
        self.verify()
    }

    /// Labels detected on the host.
    pub fn labels(&self) -> Vec<String> {
        let ctx = LabelContext {
            transport: self.transport.as_ref(),
            has_servo: self.has_servo(),
            chameleon: self.chameleon.as_deref(),
            has_rpm: self.has_power(),
        };
        detect_labels(LABEL_DETECTORS, &ctx)
    }

    // Repair

    fn reboot_repair(&self) -> Result<(), HostError> {
        if !self.transport.is_up(self.config.timeouts.check_host_up) {
            return Err(HostError::not_applicable("DUT unreachable for reboot"));
        }
        info!(hostname = %self.hostname, "attempting repair via ssh reboot");
        self.transport.reboot(self.config.timeouts.boot)
    }

    fn servo_repair_power(&self) -> Result<(), HostError> {
        let servo = self.require_servo("repair power")?;
        info!(hostname = %self.hostname, "attempting repair by powering off and on through servo");
        servo.power_off()?;
        servo.power_on()?;
        if self.transport.wait_up(self.config.timeouts.boot) {
            Ok(())
        } else {
            Err(HostError::timeout(
                format!("{} to boot after servo power cycle", self.hostname),
                self.config.timeouts.boot,
            ))
        }
    }

    fn powercycle_to_repair(&self) -> Result<(), HostError> {
        if !self.has_power() {
            return Err(HostError::not_applicable("device does not support power"));
        }
        info!(hostname = %self.hostname, "attempting repair via RPM powercycle");
        let boot = self.config.timeouts.boot;
        let max_cycles = self.config.repair.max_power_cycle_attempts;
        let mut failed_cycles = 0;
        self.power_cycle()?;
        while !self.transport.wait_up(boot) {
            failed_cycles += 1;
            if failed_cycles >= max_cycles {
                return Err(HostError::timeout(
                    format!(
                        "{} to come back online after {failed_cycles} power cycles",
                        self.hostname
                    ),
                    boot,
                ));
            }
            self.power_cycle()?;
        }
        info!(hostname = %self.hostname, failed_cycles, "powercycling was successful");
        Ok(())
    }

    fn install_repair(&self) -> Result<(), HostError> {
        if !self.transport.is_up(self.config.timeouts.check_host_up) {
            return Err(HostError::not_applicable("DUT unreachable for install"));
        }
        info!(hostname = %self.hostname, "attempting to reimage to the repair image");
        self.machine_install(&InstallRequest::repair())?;
        Ok(())
    }

    fn install_repair_with_powerwash(&self) -> Result<(), HostError> {
        if !self.transport.is_up(self.config.timeouts.check_host_up) {
            return Err(HostError::not_applicable("DUT unreachable for install"));
        }
        self.powerwash()?;
        self.install_repair()
    }

    fn servo_repair_reinstall(&self) -> Result<(), HostError> {
        self.require_servo("repair reinstall")?;
        info!(hostname = %self.hostname, "attempting recovery with servo reinstall");
        let image_url = self.orchestrator().stage_image_for_servo(None)?;
        self.servo_install(Some(&image_url))
    }

    /// Runs repair actions in escalation order until the host passes
    /// [`check_device`](Self::check_device).
    pub fn repair_full(&mut self) -> Result<RepairReport, HostError> {
        let clock = Arc::clone(&self.clock);
        let metrics = self.metrics.repair_metrics().clone();
        RepairController::new(clock.as_ref())
            .with_metrics(&metrics)
            .run(self)
    }

    /// Registry holding this host's repair counters.
    #[must_use]
    pub const fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }
}

impl Repairable for CrosHost {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn run_repair_action(&mut self, action: RepairAction) -> Result<(), HostError> {
        match action {
            RepairAction::Reboot => self.reboot_repair(),
            RepairAction::ServoPower => self.servo_repair_power(),
            RepairAction::RpmPowercycle => self.powercycle_to_repair(),
            RepairAction::Install => self.install_repair(),
            RepairAction::InstallWithPowerwash => self.install_repair_with_powerwash(),
            RepairAction::ServoReinstall => self.servo_repair_reinstall(),
        }
    }

    fn check_device(&mut self) -> Result<(), HostError> {
        CrosHost::check_device(self)
    }

    fn board(&self) -> Option<String> {
        match self.inventory.board(&self.hostname) {
            Ok(board) => board,
            Err(e) => {
                warn!(hostname = %self.hostname, error = %e, "failed to look up board for repair metrics");
                None
            },
        }
    }
}

impl Drop for CrosHost {
    fn drop(&mut self) {
        if self.tunnels.is_empty() {
            return;
        }
        if let Err(e) = self.tunnels.disconnect_all(self.transport.as_ref()) {
            warn!(hostname = %self.hostname, error = %e, "failed to release rpc tunnels on drop");
        }
    }
}

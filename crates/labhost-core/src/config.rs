//! Configuration parsing and management.
//!
//! A lab server reads one TOML file describing timeouts, retry budgets and
//! where to find the lab services (devservers, inventory, RPM frontend,
//! servo). Every field has a default, so an empty file is a valid config.
//!
//! ```toml
//! [timeouts]
//! reboot = "8m"
//! rpc_shutdown = "30s"
//!
//! [update]
//! flaky_devserver_attempts = 2
//!
//! [devservers]
//! urls = ["http://devserver1:8082", "http://devserver2:8082"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default regex recognising hostnames of RPM-controlled lab DUTs.
pub const DEFAULT_RPM_HOSTNAME_REGEX: &str =
    r"chromeos(\d+)(-row(\d+))?-rack(\d+[a-z]*)-host(\d+)";

/// Top-level lab configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    /// Bounded-wait budgets.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Image update behaviour.
    #[serde(default)]
    pub update: UpdateConfig,

    /// Repair escalation behaviour.
    #[serde(default)]
    pub repair: RepairConfig,

    /// Image distribution servers.
    #[serde(default)]
    pub devservers: DevserverConfig,

    /// Inventory service.
    #[serde(default)]
    pub afe: AfeConfig,

    /// Remote power management frontend.
    #[serde(default)]
    pub rpm: RpmConfig,

    /// Servo control.
    #[serde(default)]
    pub servo: ServoConfig,

    /// SSH session options.
    #[serde(default)]
    pub ssh: SshConfig,
}

impl LabConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update.flaky_devserver_attempts == 0 {
            return Err(ConfigError::Validation(
                "update.flaky_devserver_attempts must be at least 1".to_string(),
            ));
        }
        if self.repair.max_power_cycle_attempts == 0 {
            return Err(ConfigError::Validation(
                "repair.max_power_cycle_attempts must be at least 1".to_string(),
            ));
        }
        for placeholder in ["{board}", "{version}"] {
            if !self.update.stable_build_pattern.contains(placeholder) {
                return Err(ConfigError::Validation(format!(
                    "update.stable_build_pattern must contain {placeholder}"
                )));
            }
        }
        if !self.update.image_url_pattern.contains("{image}") {
            return Err(ConfigError::Validation(
                "update.image_url_pattern must contain {image}".to_string(),
            ));
        }
        regex::Regex::new(&self.rpm.hostname_regex).map_err(|e| {
            ConfigError::Validation(format!("rpm.hostname_regex is not a valid regex: {e}"))
        })?;
        if self.timeouts.rpc_shutdown_poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "timeouts.rpc_shutdown_poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded-wait budgets, written as humantime strings (`"30s"`, `"8m"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Boot from power off.
    #[serde(default = "default_boot", with = "humantime_serde")]
    pub boot: Duration,

    /// Reboot over the transport.
    #[serde(default = "default_reboot", with = "humantime_serde")]
    pub reboot: Duration,

    /// Reboot that includes a powerwash.
    #[serde(default = "default_powerwash_boot", with = "humantime_serde")]
    pub powerwash_boot: Duration,

    /// Boot from a USB recovery image.
    #[serde(default = "default_usb_boot", with = "humantime_serde")]
    pub usb_boot: Duration,

    /// `chromeos-install` run.
    #[serde(default = "default_install", with = "humantime_serde")]
    pub install: Duration,

    /// Quick reachability check before a repair action.
    #[serde(default = "default_check_host_up", with = "humantime_serde")]
    pub check_host_up: Duration,

    /// Confirmation that a remote RPC server exited.
    #[serde(default = "default_rpc_shutdown", with = "humantime_serde")]
    pub rpc_shutdown: Duration,

    /// Poll interval while confirming RPC server exit.
    #[serde(default = "default_rpc_shutdown_poll_interval", with = "humantime_serde")]
    pub rpc_shutdown_poll_interval: Duration,

    /// Wait between power off and power on.
    #[serde(default = "default_power_cycle", with = "humantime_serde")]
    pub power_cycle: Duration,

    /// Settle time between an image write and reading kernel priorities.
    #[serde(default = "default_post_update_settle", with = "humantime_serde")]
    pub post_update_settle: Duration,
}

const fn default_boot() -> Duration {
    Duration::from_secs(60)
}

const fn default_reboot() -> Duration {
    Duration::from_secs(480)
}

const fn default_powerwash_boot() -> Duration {
    Duration::from_secs(60)
}

const fn default_usb_boot() -> Duration {
    Duration::from_secs(300)
}

const fn default_install() -> Duration {
    Duration::from_secs(480)
}

const fn default_check_host_up() -> Duration {
    Duration::from_secs(15)
}

const fn default_rpc_shutdown() -> Duration {
    Duration::from_secs(30)
}

const fn default_rpc_shutdown_poll_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_power_cycle() -> Duration {
    Duration::from_secs(10)
}

const fn default_post_update_settle() -> Duration {
    Duration::from_secs(10)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            boot: default_boot(),
            reboot: default_reboot(),
            powerwash_boot: default_powerwash_boot(),
            usb_boot: default_usb_boot(),
            install: default_install(),
            check_host_up: default_check_host_up(),
            rpc_shutdown: default_rpc_shutdown(),
            rpc_shutdown_poll_interval: default_rpc_shutdown_poll_interval(),
            power_cycle: default_power_cycle(),
            post_update_settle: default_post_update_settle(),
        }
    }
}

/// Image update behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Attempts at a full update before giving up on flaky devservers.
    #[serde(default = "default_flaky_devserver_attempts")]
    pub flaky_devserver_attempts: u32,

    /// Image name for a board's stable version.
    #[serde(default = "default_stable_build_pattern")]
    pub stable_build_pattern: String,

    /// Update URL for a staged image.
    #[serde(default = "default_image_url_pattern")]
    pub image_url_pattern: String,

    /// Image installed when no explicit URL is requested.
    #[serde(default)]
    pub default_image: Option<String>,
}

const fn default_flaky_devserver_attempts() -> u32 {
    2
}

fn default_stable_build_pattern() -> String {
    "{board}-release/{version}".to_string()
}

fn default_image_url_pattern() -> String {
    "{devserver}/update/{image}".to_string()
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            flaky_devserver_attempts: default_flaky_devserver_attempts(),
            stable_build_pattern: default_stable_build_pattern(),
            image_url_pattern: default_image_url_pattern(),
            default_image: None,
        }
    }
}

/// Repair escalation behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Power cycles attempted by the RPM repair action.
    #[serde(default = "default_max_power_cycle_attempts")]
    pub max_power_cycle_attempts: u32,
}

const fn default_max_power_cycle_attempts() -> u32 {
    6
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_power_cycle_attempts: default_max_power_cycle_attempts(),
        }
    }
}

/// Image distribution servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevserverConfig {
    /// Base URLs, e.g. `http://devserver1:8082`.
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Inventory service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfeConfig {
    /// JSON-RPC endpoint.
    #[serde(default)]
    pub url: Option<String>,
}

/// Remote power management frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmConfig {
    /// JSON-RPC endpoint of the RPM frontend.
    #[serde(default)]
    pub url: Option<String>,

    /// Hostnames matching this regex are RPM-controlled.
    #[serde(default = "default_rpm_hostname_regex")]
    pub hostname_regex: String,
}

fn default_rpm_hostname_regex() -> String {
    DEFAULT_RPM_HOSTNAME_REGEX.to_string()
}

impl Default for RpmConfig {
    fn default() -> Self {
        Self {
            url: None,
            hostname_regex: default_rpm_hostname_regex(),
        }
    }
}

/// Servo control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoConfig {
    /// Host running servod; no servo when unset.
    #[serde(default)]
    pub host: Option<String>,

    /// servod port.
    #[serde(default = "default_servo_port")]
    pub port: u16,

    /// `dut-control` executable.
    #[serde(default = "default_dut_control")]
    pub dut_control: String,
}

const fn default_servo_port() -> u16 {
    9999
}

fn default_dut_control() -> String {
    "dut-control".to_string()
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_servo_port(),
            dut_control: default_dut_control(),
        }
    }
}

/// SSH session options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// Login user.
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// `ConnectTimeout` passed to ssh.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Additional `-o` options.
    #[serde(default)]
    pub extra_options: Vec<String>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

const fn default_ssh_port() -> u16 {
    22
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            connect_timeout: default_connect_timeout(),
            extra_options: Vec::new(),
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serde adapter for humantime durations.
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

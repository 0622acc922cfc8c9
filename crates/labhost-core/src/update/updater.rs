//! Image updates driven over the transport with `update_engine_client`,
//! `stateful_update` and `cgpt`.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use super::image::{static_url, url_to_image_name, version_match};
use crate::error::HostError;
use crate::transport::{RunOptions, Transport};

/// Budget for a full root filesystem update.
const ROOT_UPDATE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Budget for a stateful partition update.
const STATEFUL_UPDATE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Status reported by update_engine once a payload is written.
const UPDATED_NEED_REBOOT: &str = "UPDATE_STATUS_UPDATED_NEED_REBOOT";

const STATEFUL_UPDATE: &str = "/usr/local/bin/stateful_update";

const LSB_RELEASE: &str = "/etc/lsb-release";

/// One of the two A/B kernel slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelPartition {
    /// GPT label, `KERN-A` or `KERN-B`.
    pub name: &'static str,
    /// Kernel partition number.
    pub kernel: u32,
    /// Root filesystem partition paired with the kernel.
    pub root: u32,
}

/// Slot A.
pub const KERNEL_A: KernelPartition = KernelPartition {
    name: "KERN-A",
    kernel: 2,
    root: 3,
};

/// Slot B.
pub const KERNEL_B: KernelPartition = KernelPartition {
    name: "KERN-B",
    kernel: 4,
    root: 5,
};

impl fmt::Display for KernelPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Writes one image to one host.
pub trait Updater {
    /// URL the image is served from.
    fn update_url(&self) -> &str;

    /// Image name, e.g. `lumpy-release/R27-3837.0.0`.
    fn image_name(&self) -> &str {
        url_to_image_name(self.update_url())
    }

    /// Whether the host already runs the image, allowing for builds whose
    /// reported version omits the builder path.
    fn check_version(&self) -> Result<bool, HostError>;

    /// Whether the host runs exactly the image.
    fn check_version_to_confirm_install(&self) -> Result<bool, HostError>;

    /// Writes the image. With `update_root` false only the stateful
    /// partition is refreshed.
    fn run_update(&self, update_root: bool) -> Result<(), HostError>;

    /// The active and inactive kernel slots.
    fn kernel_state(&self) -> Result<(KernelPartition, KernelPartition), HostError>;

    /// GPT priority of a kernel slot.
    fn kernel_priority(&self, kernel: KernelPartition) -> Result<u32, HostError>;

    /// Checks the host booted `expected`, when given.
    fn verify_boot_expectations(
        &self,
        expected: Option<KernelPartition>,
        rollback_message: &str,
    ) -> Result<(), HostError> {
        let Some(expected) = expected else {
            return Ok(());
        };
        let (active, _) = self.kernel_state()?;
        if active == expected {
            debug!(kernel = %active, "booted the expected kernel");
            Ok(())
        } else {
            Err(HostError::verification(format!(
                "{rollback_message} (expected {expected}, booted {active})"
            )))
        }
    }
}

/// Creates updaters bound to a transport.
pub trait UpdaterFactory: Send + Sync {
    /// An updater writing `update_url` through `transport`.
    fn updater<'a>(&self, transport: &'a dyn Transport, update_url: &str)
    -> Box<dyn Updater + 'a>;
}

/// Parses `KEY=value` lines from `/etc/lsb-release`.
#[must_use]
pub fn lsb_release_value<'a>(lsb_release: &'a str, key: &str) -> Option<&'a str> {
    lsb_release.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Updater for ChromiumOS devices.
pub struct ChromiumOsUpdater<'a> {
    transport: &'a dyn Transport,
    update_url: String,
}

impl fmt::Debug for ChromiumOsUpdater<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChromiumOsUpdater")
            .field("hostname", &self.transport.hostname())
            .field("update_url", &self.update_url)
            .finish()
    }
}

impl<'a> ChromiumOsUpdater<'a> {
    /// Creates an updater for `update_url`.
    #[must_use]
    pub fn new(transport: &'a dyn Transport, update_url: impl Into<String>) -> Self {
        Self {
            transport,
            update_url: update_url.into(),
        }
    }

    fn lsb_release(&self) -> Result<String, HostError> {
        Ok(self.transport.run(&format!("cat {LSB_RELEASE}"))?.stdout)
    }

    fn update_engine_status(&self) -> Result<String, HostError> {
        let result = self.transport.run_with(
            "update_engine_client --status 2>&1",
            &RunOptions::new().timeout(Duration::from_secs(30)),
        )?;
        Ok(result
            .stdout
            .lines()
            .find_map(|line| line.strip_prefix("CURRENT_OP="))
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    fn reset_update_engine(&self) -> Result<(), HostError> {
        self.transport.run_with(
            "stop ui; update_engine_client --reset_status",
            &RunOptions::new().ignore_status(),
        )?;
        Ok(())
    }

    fn update_root(&self) -> Result<(), HostError> {
        info!(hostname = %self.transport.hostname(), update_url = %self.update_url, "updating root filesystem");
        self.reset_update_engine()?;
        self.transport.run_with(
            &format!("update_engine_client --update --omaha_url={}", self.update_url),
            &RunOptions::new().timeout(ROOT_UPDATE_TIMEOUT),
        )?;
        let status = self.update_engine_status()?;
        if status != UPDATED_NEED_REBOOT {
            return Err(HostError::verification(format!(
                "update engine finished in state {status}, expected {UPDATED_NEED_REBOOT}"
            )));
        }
        Ok(())
    }

    fn update_stateful(&self) -> Result<(), HostError> {
        info!(hostname = %self.transport.hostname(), update_url = %self.update_url, "updating stateful partition");
        self.transport.run_with(
            &format!(
                "{STATEFUL_UPDATE} {} --stateful_change=clean",
                static_url(&self.update_url)
            ),
            &RunOptions::new().timeout(STATEFUL_UPDATE_TIMEOUT),
        )?;
        Ok(())
    }

    fn root_device(&self) -> Result<String, HostError> {
        Ok(self
            .transport
            .run("rootdev -s -d")?
            .stdout_trimmed()
            .to_string())
    }
}

impl Updater for ChromiumOsUpdater<'_> {
    fn update_url(&self) -> &str {
        &self.update_url
    }

    fn check_version(&self) -> Result<bool, HostError> {
        let lsb_release = self.lsb_release()?;
        let image_name = self.image_name();
        if lsb_release_value(&lsb_release, "CHROMEOS_RELEASE_BUILDER_PATH") == Some(image_name) {
            return Ok(true);
        }
        // Builds without a builder path only report `<build>.<branch>.<patch>`.
        Ok(lsb_release_value(&lsb_release, "CHROMEOS_RELEASE_VERSION")
            .is_some_and(|running| version_match(image_name, running)))
    }

    fn check_version_to_confirm_install(&self) -> Result<bool, HostError> {
        let lsb_release = self.lsb_release()?;
        Ok(lsb_release_value(&lsb_release, "CHROMEOS_RELEASE_BUILDER_PATH")
            == Some(self.image_name()))
    }

    fn run_update(&self, update_root: bool) -> Result<(), HostError> {
        if update_root {
            self.update_root()?;
        }
        self.update_stateful()
    }

    fn kernel_state(&self) -> Result<(KernelPartition, KernelPartition), HostError> {
        let root = self.transport.run("rootdev -s")?;
        let root = root.stdout_trimmed();
        // `/dev/sda3`, `/dev/mmcblk0p5`, ...
        match root.chars().last() {
            Some('3') => Ok((KERNEL_A, KERNEL_B)),
            Some('5') => Ok((KERNEL_B, KERNEL_A)),
            _ => Err(HostError::consistency(format!(
                "unexpected root partition {root}"
            ))),
        }
    }

    fn kernel_priority(&self, kernel: KernelPartition) -> Result<u32, HostError> {
        let device = self.root_device()?;
        let output = self
            .transport
            .run(&format!("cgpt show -n -i {} -P {device}", kernel.kernel))?;
        output.stdout_trimmed().parse().map_err(|_| {
            HostError::consistency(format!(
                "unreadable priority for {kernel}: {}",
                output.stdout_trimmed()
            ))
        })
    }
}

/// Creates [`ChromiumOsUpdater`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChromiumOsUpdaterFactory;

impl UpdaterFactory for ChromiumOsUpdaterFactory {
    fn updater<'a>(
        &self,
        transport: &'a dyn Transport,
        update_url: &str,
    ) -> Box<dyn Updater + 'a> {
        Box::new(ChromiumOsUpdater::new(transport, update_url))
    }
}

//! Image installation: `machine_install`.
//!
//! An install resolves the image to write, clears the host's version
//! markers in the inventory, then takes the cheapest path that leaves the
//! host on the requested build:
//!
//! 1. nothing, when the host already runs it and no update is forced;
//! 2. a stateful-only refresh, for release builds the host already runs;
//! 3. a full A/B update, retried on another devserver when the serving one
//!    turns out to be unhealthy.
//!
//! The host is then checked to have booted the new kernel and build before
//! the version label and `job_repo_url` are written back.

pub mod image;
mod updater;

use std::cell::RefCell;
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use self::updater::{
    ChromiumOsUpdater, ChromiumOsUpdaterFactory, KERNEL_A, KERNEL_B, KernelPartition, Updater,
    UpdaterFactory, lsb_release_value,
};
use crate::clock::Clock;
use crate::config::LabConfig;
use crate::devserver::{ImageServer, ImageServerPool};
use crate::error::HostError;
use crate::inventory::{Inventory, JOB_REPO_URL, StableVersionSource, VERSION_PREFIX};
use crate::retry::{RetryDecision, RetryError, RetryPolicy};
use crate::transport::{RunOptions, Transport};

/// Marker distinguishing lab-installed images from other test images.
pub const LAB_MACHINE_FILE: &str = "/mnt/stateful_partition/.labmachine";

/// Directories a stateful update must rebuild.
pub const STATEFUL_CHECK_DIRS: [&str; 3] = ["/var", "/home", "/mnt/stateful_partition"];

/// File touched in each of [`STATEFUL_CHECK_DIRS`] before a stateful update.
pub const STATEFUL_CHECK_FILE: &str = ".test_file_to_be_deleted";

/// What to install and how hard to try.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRequest {
    /// Update URL, used as-is.
    pub update_url: Option<String>,
    /// Build name (or URL) to stage when no update URL is given. Falls back
    /// to the configured default image.
    pub image: Option<String>,
    /// Write the image even if the host already runs it.
    pub force_update: bool,
    /// Install the board's stable image. Implies `force_update`.
    pub repair: bool,
    /// Skip the stateful-only fast path.
    pub force_full_update: bool,
}

impl InstallRequest {
    /// An install of the default image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A repair install of the stable image.
    #[must_use]
    pub fn repair() -> Self {
        Self {
            repair: true,
            ..Self::default()
        }
    }

    /// Installs from `url`.
    #[must_use]
    pub fn update_url(mut self, url: impl Into<String>) -> Self {
        self.update_url = Some(url.into());
        self
    }

    /// Stages and installs `image`.
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Sets `force_update`.
    #[must_use]
    pub const fn force_update(mut self, force: bool) -> Self {
        self.force_update = force;
        self
    }

    /// Sets `force_full_update`.
    #[must_use]
    pub const fn force_full_update(mut self, force: bool) -> Self {
        self.force_full_update = force;
        self
    }
}

/// How an install left the host on the requested build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The host already ran the build; nothing was written.
    AlreadyInstalled,
    /// Only the stateful partition was refreshed.
    StatefulUpdate,
    /// The full image was written and booted.
    FullUpdate,
}

/// State of one `machine_install` call.
struct UpdateAttempt {
    update_url: String,
    devserver: Option<Arc<dyn ImageServer>>,
    force_update: bool,
    inactive_kernel: Option<KernelPartition>,
}

impl UpdateAttempt {
    fn image_name(&self) -> &str {
        image::url_to_image_name(&self.update_url)
    }
}

/// Installs images on one host.
pub struct UpdateOrchestrator<'a> {
    /// Session to the host.
    pub transport: &'a dyn Transport,
    /// Label and attribute storage.
    pub inventory: &'a dyn Inventory,
    /// Stable version per board.
    pub stable_versions: &'a dyn StableVersionSource,
    /// Devservers images are staged on.
    pub devservers: &'a dyn ImageServerPool,
    /// Creates the updaters that write images.
    pub updaters: &'a dyn UpdaterFactory,
    /// Time source for settle delays.
    pub clock: &'a dyn Clock,
    /// Timeouts and update settings.
    pub config: &'a LabConfig,
}

impl UpdateOrchestrator<'_> {
    fn hostname(&self) -> &str {
        self.transport.hostname()
    }

    /// The stable image name for the host's board.
    pub fn repair_image_name(&self) -> Result<String, HostError> {
        let board = self.inventory.board(self.hostname())?.ok_or_else(|| {
            HostError::infra(format!(
                "{} has no board label, cannot be repaired",
                self.hostname()
            ))
        })?;
        let version = self.stable_versions.stable_version(&board)?;
        Ok(image::stable_image_name(
            &self.config.update.stable_build_pattern,
            &board,
            &version,
        ))
    }

    /// Stages `image_name` for an update and returns its URL and devserver.
    pub fn stage_image_for_update(
        &self,
        image_name: &str,
    ) -> Result<(String, Arc<dyn ImageServer>), HostError> {
        info!(hostname = %self.hostname(), image = image_name, "staging build for update");
        let devserver = self.devservers.resolve(image_name)?;
        devserver.trigger_download(image_name, false)?;
        let url = image::update_url(
            &self.config.update.image_url_pattern,
            devserver.url(),
            image_name,
        );
        Ok((url, devserver))
    }

    /// Stages the test image for a USB install and returns its URL. Without
    /// `image_name` the stable image is used.
    pub fn stage_image_for_servo(&self, image_name: Option<&str>) -> Result<String, HostError> {
        let image_name = match image_name {
            Some(name) => name.to_string(),
            None => self.repair_image_name()?,
        };
        info!(hostname = %self.hostname(), image = %image_name, "staging build for servo install");
        let devserver = self.devservers.resolve(&image_name)?;
        devserver.stage_artifacts(&image_name, &["test_image"])?;
        Ok(devserver.test_image_url(&image_name))
    }

    fn resolve_target(&self, request: &InstallRequest) -> Result<UpdateAttempt, HostError> {
        if request.repair {
            let (update_url, devserver) = self.stage_image_for_update(&self.repair_image_name()?)?;
            return Ok(UpdateAttempt {
                update_url,
                devserver: Some(devserver),
                force_update: true,
                inactive_kernel: None,
            });
        }

        if let Some(url) = &request.update_url {
            return Ok(UpdateAttempt {
                update_url: url.clone(),
                devserver: None,
                force_update: request.force_update,
                inactive_kernel: None,
            });
        }

        let requested = request
            .image
            .as_deref()
            .or(self.config.update.default_image.as_deref())
            .ok_or_else(|| HostError::infra("there is no update URL, nor a method to get one"))?;

        let (update_url, devserver) = if image::is_url(requested) {
            (requested.to_string(), None)
        } else {
            let (url, devserver) = self.stage_image_for_update(requested)?;
            (url, Some(devserver))
        };
        Ok(UpdateAttempt {
            update_url,
            devserver,
            force_update: request.force_update,
            inactive_kernel: None,
        })
    }

    /// Sets `job_repo_url` to the package URL of `image_name` on
    /// `devserver`, or clears it, and reads it back.
    pub fn update_job_repo_url(
        &self,
        target: Option<(&dyn ImageServer, &str)>,
    ) -> Result<(), HostError> {
        let repo_url = target.map(|(devserver, image_name)| devserver.package_url(image_name));
        self.inventory
            .set_attribute(self.hostname(), JOB_REPO_URL, repo_url.as_deref())?;
        let stored = self.inventory.attribute(self.hostname(), JOB_REPO_URL)?;
        if stored != repo_url {
            return Err(HostError::infra(format!(
                "failed to update job_repo_url with {repo_url:?}, host {}",
                self.hostname()
            )));
        }
        Ok(())
    }

    /// Removes `cros-version:` labels and the `job_repo_url` attribute.
    pub fn clear_version_markers(&self) -> Result<(), HostError> {
        if !self.inventory.has_host(self.hostname())? {
            return Ok(());
        }
        self.inventory
            .remove_labels_with_prefix(self.hostname(), VERSION_PREFIX)?;
        self.update_job_repo_url(None)
    }

    /// Adds the `cros-version:` label and `job_repo_url` for `image_name`.
    pub fn add_version_markers(&self, image_name: &str) -> Result<(), HostError> {
        if !self.inventory.has_host(self.hostname())? {
            return Ok(());
        }
        let devserver = self.devservers.resolve(image_name)?;
        self.inventory
            .add_label(self.hostname(), &format!("{VERSION_PREFIX}{image_name}"))?;
        self.update_job_repo_url(Some((devserver.as_ref(), image_name)))
    }

    /// Refreshes only the stateful partition when the host already runs a
    /// release build of the image. Returns false when the fast path does not
    /// apply or did not verifiably rebuild the stateful directories.
    fn try_stateful_update(
        &self,
        updater: &dyn Updater,
        force_update: bool,
    ) -> Result<bool, HostError> {
        if !image::is_release_build(updater.image_name()) {
            return Ok(false);
        }
        if !updater.check_version()? {
            return Ok(false);
        }
        if !force_update {
            info!(
                hostname = %self.hostname(),
                "canceling stateful update, the new and old versions are the same"
            );
            return Ok(false);
        }

        for dir in STATEFUL_CHECK_DIRS {
            self.transport
                .run(&format!("touch {dir}/{STATEFUL_CHECK_FILE}"))?;
        }
        updater.run_update(false)?;
        self.transport.reboot(self.config.timeouts.reboot)?;

        for dir in STATEFUL_CHECK_DIRS {
            let result = self.transport.run_with(
                &format!("test -f {dir}/{STATEFUL_CHECK_FILE}; echo $?"),
                &RunOptions::new().ignore_status(),
            )?;
            if result.stdout_trimmed() == "0" {
                debug!(hostname = %self.hostname(), dir, "stateful update left its marker behind");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn restage_if_unhealthy(&self, attempt: &mut UpdateAttempt, err: &HostError) -> RetryDecision {
        warn!(hostname = %self.hostname(), error = %err, "autoupdate did not complete");
        let Some(devserver) = attempt.devserver.as_ref() else {
            return RetryDecision::Abort;
        };
        if self.devservers.is_healthy(devserver.url()) {
            return RetryDecision::Abort;
        }

        warn!(devserver = %devserver.url(), "devserver looks unhealthy, trying another");
        let image_name = attempt.image_name().to_string();
        match self.stage_image_for_update(&image_name) {
            Ok((update_url, devserver)) => {
                debug!(update_url = %update_url, "new update url");
                attempt.update_url = update_url;
                attempt.devserver = Some(devserver);
                RetryDecision::Retry
            },
            Err(e) => {
                warn!(error = %e, "failed to restage image on another devserver");
                RetryDecision::Abort
            },
        }
    }

    fn full_update(&self, attempt: UpdateAttempt) -> Result<UpdateAttempt, HostError> {
        info!(hostname = %self.hostname(), "host requires full update");
        self.transport.reboot(self.config.timeouts.reboot)?;

        let attempt = RefCell::new(attempt);
        RetryPolicy::attempts(self.config.update.flaky_devserver_attempts)
            .run(
                self.clock,
                |n| {
                    let update_url = attempt.borrow().update_url.clone();
                    debug!(attempt = n, update_url = %update_url, "running full update");
                    self.updaters
                        .updater(self.transport, &update_url)
                        .run_update(true)
                },
                |err| self.restage_if_unhealthy(&mut attempt.borrow_mut(), err),
            )
            .map_err(RetryError::into_inner)?;
        let mut attempt = attempt.into_inner();

        self.clock.sleep(self.config.timeouts.post_update_settle);

        let updater = self.updaters.updater(self.transport, &attempt.update_url);
        let (active, inactive) = updater.kernel_state()?;
        if updater.kernel_priority(inactive)? < updater.kernel_priority(active)? {
            return Err(HostError::consistency(
                "update failed: the priority of the inactive kernel partition is less than \
                 that of the active kernel partition",
            ));
        }

        self.transport.reboot(self.config.timeouts.reboot)?;
        attempt.inactive_kernel = Some(inactive);
        Ok(attempt)
    }

    fn post_update_processing(
        &self,
        updater: &dyn Updater,
        expected_kernel: Option<KernelPartition>,
    ) -> Result<(), HostError> {
        self.transport.run(&format!("touch {LAB_MACHINE_FILE}"))?;
        self.transport.run("start autoreboot")?;

        updater.verify_boot_expectations(
            expected_kernel,
            &format!(
                "build {} failed to boot on {}; system rolled back to previous build",
                updater.image_name(),
                self.hostname()
            ),
        )?;
        if !updater.check_version_to_confirm_install()? {
            return Err(HostError::verification(format!(
                "failed to update {} to build {}",
                self.hostname(),
                updater.image_name()
            )));
        }
        Ok(())
    }

    /// Installs the requested image.
    pub fn machine_install(&self, request: &InstallRequest) -> Result<InstallOutcome, HostError> {
        let attempt = self.resolve_target(request)?;
        debug!(hostname = %self.hostname(), update_url = %attempt.update_url, "update url resolved");

        self.clear_version_markers()?;

        let mut stateful_done = false;
        if !request.force_full_update {
            let updater = self.updaters.updater(self.transport, &attempt.update_url);
            match self.try_stateful_update(updater.as_ref(), attempt.force_update) {
                Ok(done) => stateful_done = done,
                Err(e) => warn!(hostname = %self.hostname(), error = %e, "stateful update failed"),
            }
        }

        let (attempt, outcome) = if stateful_done {
            (attempt, InstallOutcome::StatefulUpdate)
        } else if !attempt.force_update
            && self
                .updaters
                .updater(self.transport, &attempt.update_url)
                .check_version()?
        {
            (attempt, InstallOutcome::AlreadyInstalled)
        } else {
            (self.full_update(attempt)?, InstallOutcome::FullUpdate)
        };
        if outcome != InstallOutcome::FullUpdate {
            info!(hostname = %self.hostname(), "install complete without full update");
        }

        let updater = self.updaters.updater(self.transport, &attempt.update_url);
        self.post_update_processing(updater.as_ref(), attempt.inactive_kernel)?;
        self.add_version_markers(attempt.image_name())?;
        info!(hostname = %self.hostname(), image = %attempt.image_name(), ?outcome, "install complete");
        Ok(outcome)
    }
}

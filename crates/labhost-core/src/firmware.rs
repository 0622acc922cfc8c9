//! Firmware installation through a servo.
//!
//! The firmware tarball of a build is staged on a devserver, fetched to a
//! scratch directory, unpacked and flashed: EC first, then AP. The host's
//! `fw-version:` label tracks what was flashed.

use std::fs::File;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::info;

use crate::clock::Clock;
use crate::devserver::ImageServerPool;
use crate::error::HostError;
use crate::inventory::{FW_VERSION_PREFIX, Inventory};
use crate::process::run_command;
use crate::servo::{BOOT_DELAY, Servo};

/// EC image inside the firmware tarball.
pub const EC_IMAGE: &str = "ec.bin";

/// AP image inside the firmware tarball.
pub const AP_IMAGE: &str = "image.bin";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetches a URL to a local file.
pub trait ArtifactFetcher: Send + Sync {
    /// Writes the body of `url` to `dest`.
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), HostError>;
}

/// Plain HTTP GET.
#[derive(Debug, Default, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), HostError> {
        let mut response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|e| HostError::transient(format!("failed to download {url}: {e}")))?;
        let mut file =
            File::create(dest).map_err(|e| HostError::io("creating firmware tarball", e))?;
        response
            .copy_to(&mut file)
            .map_err(|e| HostError::transient(format!("failed to download {url}: {e}")))?;
        Ok(())
    }
}

/// Unpacks `members` of `tarball` into `dir`.
fn extract(tarball: &Path, dir: &Path, members: &[&str]) -> Result<(), HostError> {
    let mut cmd = Command::new("tar");
    cmd.arg("xf").arg(tarball).arg("-C").arg(dir).args(members);
    run_command(&mut cmd, Some(EXTRACT_TIMEOUT))?.check()?;
    Ok(())
}

/// Everything a firmware install touches.
pub struct FirmwareInstall<'a> {
    /// Host being flashed.
    pub hostname: &'a str,
    /// Servo attached to the host.
    pub servo: &'a dyn Servo,
    /// Devservers the firmware is staged on.
    pub devservers: &'a dyn ImageServerPool,
    /// Label storage.
    pub inventory: &'a dyn Inventory,
    /// Downloads the tarball.
    pub fetcher: &'a dyn ArtifactFetcher,
    /// Waits out the boot delay.
    pub clock: &'a dyn Clock,
}

impl FirmwareInstall<'_> {
    /// Flashes the firmware of `build`, e.g. `link-firmware/R22-2695.1.144`.
    pub fn run(&self, build: &str) -> Result<(), HostError> {
        let devserver = self.devservers.resolve(build)?;
        devserver.stage_artifacts(build, &["firmware"])?;

        let scratch = tempfile::Builder::new()
            .prefix("fwimage")
            .tempdir()
            .map_err(|e| HostError::io("creating firmware scratch directory", e))?;
        let url = devserver.firmware_url(build);
        let file_name = url.rsplit('/').next().unwrap_or("firmware.tar.bz2");
        let tarball = scratch.path().join(file_name);
        info!(hostname = self.hostname, url = %url, "downloading firmware");
        self.fetcher.fetch(&url, &tarball)?;
        extract(&tarball, scratch.path(), &[AP_IMAGE, EC_IMAGE])?;

        self.inventory
            .remove_labels_with_prefix(self.hostname, FW_VERSION_PREFIX)?;
        info!(hostname = self.hostname, "programming EC");
        self.servo.program_ec(&scratch.path().join(EC_IMAGE))?;
        info!(hostname = self.hostname, "programming BIOS");
        self.servo.program_bios(&scratch.path().join(AP_IMAGE))?;
        self.servo.reset()?;
        self.clock.sleep(BOOT_DELAY);

        self.inventory
            .add_label(self.hostname, &format!("{FW_VERSION_PREFIX}{build}"))?;
        info!(hostname = self.hostname, build, "firmware install complete");
        Ok(())
    }
}

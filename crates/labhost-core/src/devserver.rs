//! Image distribution servers ("devservers").
//!
//! Images are staged on one devserver out of a pool and served from there.
//! [`ImageServerPool::resolve`] picks a healthy server for an image so that
//! the same image keeps landing on the same server while it stays healthy.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::HostError;

/// Google Storage bucket images are staged from.
pub const IMAGE_ARCHIVE: &str = "gs://chromeos-image-archive";

/// Budget for a health probe.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for a staging request, which blocks until the artifacts are local.
const STAGE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Free disk (GB) below which a devserver is treated as unhealthy.
pub const MIN_FREE_DISK_GB: f64 = 20.0;

/// One devserver.
pub trait ImageServer: Send + Sync + fmt::Debug {
    /// Base URL, e.g. `http://devserver1:8082`.
    fn url(&self) -> &str;

    /// Stages the named artifacts of `image` and blocks until they are ready.
    fn stage_artifacts(&self, image: &str, artifacts: &[&str]) -> Result<(), HostError>;

    /// Starts downloading the update payloads for `image`.
    fn trigger_download(&self, image: &str, synchronous: bool) -> Result<(), HostError>;

    /// URL of the staged test image, used for USB installs.
    fn test_image_url(&self, image: &str) -> String {
        format!("{}/static/{image}/chromiumos_test_image.bin", self.url())
    }

    /// URL of the staged autotest packages.
    fn package_url(&self, image: &str) -> String {
        format!("{}/static/{image}/autotest/packages", self.url())
    }

    /// URL of the staged firmware tarball.
    fn firmware_url(&self, image: &str) -> String {
        format!("{}/static/{image}/firmware_from_source.tar.bz2", self.url())
    }
}

/// The set of devservers available to the lab.
pub trait ImageServerPool: Send + Sync {
    /// Picks a healthy devserver for `image`.
    fn resolve(&self, image: &str) -> Result<Arc<dyn ImageServer>, HostError>;

    /// Probes the devserver at `url`.
    fn is_healthy(&self, url: &str) -> bool;

    /// A handle for the devserver at `url`, healthy or not.
    fn server(&self, url: &str) -> Arc<dyn ImageServer>;
}

#[derive(Debug, Deserialize)]
struct HealthReport {
    #[serde(default)]
    free_disk: Option<f64>,
}

/// A devserver reached over HTTP.
#[derive(Debug, Clone)]
pub struct DevServer {
    url: String,
    client: reqwest::blocking::Client,
}

impl DevServer {
    fn new(url: impl Into<String>, client: reqwest::blocking::Client) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn call(&self, endpoint: &str, query: &[(&str, String)]) -> Result<String, HostError> {
        let url = format!("{}/{endpoint}", self.url);
        debug!(url = %url, ?query, "devserver request");
        let response = self
            .client
            .get(&url)
            .query(query)
            .timeout(STAGE_TIMEOUT)
            .send()
            .map_err(|e| HostError::transient(format!("devserver {}: {e}", self.url)))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| HostError::transient(format!("devserver {}: {e}", self.url)))?;
        if !status.is_success() {
            return Err(HostError::transient(format!(
                "devserver {} {endpoint} returned HTTP {status}: {}",
                self.url,
                body.trim()
            )));
        }
        Ok(body)
    }
}

impl ImageServer for DevServer {
    fn url(&self) -> &str {
        &self.url
    }

    fn stage_artifacts(&self, image: &str, artifacts: &[&str]) -> Result<(), HostError> {
        info!(devserver = %self.url, image, ?artifacts, "staging artifacts");
        let body = self.call(
            "stage",
            &[
                ("archive_url", format!("{IMAGE_ARCHIVE}/{image}")),
                ("artifacts", artifacts.join(",")),
            ],
        )?;
        if body.trim() != "Success" {
            return Err(HostError::transient(format!(
                "devserver {} failed to stage {image}: {}",
                self.url,
                body.trim()
            )));
        }
        Ok(())
    }

    fn trigger_download(&self, image: &str, synchronous: bool) -> Result<(), HostError> {
        info!(devserver = %self.url, image, synchronous, "triggering download");
        self.call(
            "stage",
            &[
                ("archive_url", format!("{IMAGE_ARCHIVE}/{image}")),
                ("artifacts", "full_payload,stateful".to_string()),
                ("async", (!synchronous).to_string()),
            ],
        )?;
        Ok(())
    }
}

/// Orders `urls` by preference for `image`: a stable rotation keyed on the
/// image name.
fn preference_order<'a>(urls: &'a [String], image: &str) -> impl Iterator<Item = &'a String> {
    let mut hasher = DefaultHasher::new();
    image.hash(&mut hasher);
    let len = urls.len().max(1);
    #[allow(clippy::cast_possible_truncation)]
    let start = (hasher.finish() % len as u64) as usize;
    urls.iter().cycle().skip(start).take(urls.len())
}

/// A fixed list of HTTP devservers.
#[derive(Debug, Clone)]
pub struct DevServerPool {
    urls: Vec<String>,
    client: reqwest::blocking::Client,
}

impl DevServerPool {
    /// Creates a pool over the given base URLs.
    pub fn new(urls: Vec<String>) -> Result<Self, HostError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| HostError::infra(format!("failed to build devserver client: {e}")))?;
        Ok(Self { urls, client })
    }

    /// Configured devserver URLs.
    #[must_use]
    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

impl ImageServerPool for DevServerPool {
    fn resolve(&self, image: &str) -> Result<Arc<dyn ImageServer>, HostError> {
        if self.urls.is_empty() {
            return Err(HostError::infra("no devservers configured"));
        }
        for url in preference_order(&self.urls, image) {
            if self.is_healthy(url) {
                debug!(devserver = %url, image, "resolved devserver");
                return Ok(self.server(url));
            }
            warn!(devserver = %url, "devserver unhealthy, trying next");
        }
        Err(HostError::transient(format!("no healthy devserver for {image}")))
    }

    fn is_healthy(&self, url: &str) -> bool {
        let response = self
            .client
            .get(format!("{}/check_health", url.trim_end_matches('/')))
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send();
        let report = match response {
            Ok(r) if r.status().is_success() => r.json::<HealthReport>(),
            Ok(r) => {
                debug!(devserver = %url, status = %r.status(), "health check failed");
                return false;
            },
            Err(e) => {
                debug!(devserver = %url, error = %e, "health check failed");
                return false;
            },
        };
        match report {
            Ok(report) => report.free_disk.map_or(true, |gb| gb >= MIN_FREE_DISK_GB),
            Err(_) => false,
        }
    }

    fn server(&self, url: &str) -> Arc<dyn ImageServer> {
        Arc::new(DevServer::new(url, self.client.clone()))
    }
}

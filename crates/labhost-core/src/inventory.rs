//! Lab inventory: host labels, host attributes and stable versions.
//!
//! The inventory service owns this data; the core only reads and edits it
//! through [`Inventory`] and [`StableVersionSource`]. [`AfeClient`] talks to
//! the frontend's JSON-RPC endpoint; [`InMemoryInventory`] backs tests and
//! standalone runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::HostError;
use crate::rpc::RpcProxy;

/// Prefix of labels naming the image a host runs.
pub const VERSION_PREFIX: &str = "cros-version:";

/// Prefix of labels naming the firmware a host runs.
pub const FW_VERSION_PREFIX: &str = "fw-version:";

/// Prefix of the board label.
pub const BOARD_PREFIX: &str = "board:";

/// Host attribute holding the autotest package URL for the installed image.
pub const JOB_REPO_URL: &str = "job_repo_url";

/// Looks up the stable image version per board.
pub trait StableVersionSource: Send + Sync {
    /// Version string, e.g. `R50-7978.0.0`.
    fn stable_version(&self, board: &str) -> Result<String, HostError>;
}

/// Label and attribute storage for hosts.
pub trait Inventory: Send + Sync {
    /// Whether the inventory knows this host. Unknown hosts are left alone.
    fn has_host(&self, hostname: &str) -> Result<bool, HostError>;

    /// All labels on the host.
    fn labels(&self, hostname: &str) -> Result<Vec<String>, HostError>;

    /// Adds a label, creating it if needed.
    fn add_label(&self, hostname: &str, label: &str) -> Result<(), HostError>;

    /// Removes a label from the host.
    fn remove_label(&self, hostname: &str, label: &str) -> Result<(), HostError>;

    /// Sets an attribute; `None` deletes it.
    fn set_attribute(&self, hostname: &str, key: &str, value: Option<&str>)
    -> Result<(), HostError>;

    /// Reads an attribute.
    fn attribute(&self, hostname: &str, key: &str) -> Result<Option<String>, HostError>;

    /// Labels starting with `prefix`.
    fn labels_with_prefix(&self, hostname: &str, prefix: &str) -> Result<Vec<String>, HostError> {
        Ok(self
            .labels(hostname)?
            .into_iter()
            .filter(|l| l.starts_with(prefix))
            .collect())
    }

    /// Removes every label starting with `prefix`.
    fn remove_labels_with_prefix(&self, hostname: &str, prefix: &str) -> Result<(), HostError> {
        for label in self.labels_with_prefix(hostname, prefix)? {
            debug!(hostname, label = %label, "removing label");
            self.remove_label(hostname, &label)?;
        }
        Ok(())
    }

    /// The host's board from its `board:` label.
    fn board(&self, hostname: &str) -> Result<Option<String>, HostError> {
        Ok(self
            .labels_with_prefix(hostname, BOARD_PREFIX)?
            .first()
            .map(|l| l[BOARD_PREFIX.len()..].to_string()))
    }
}

#[derive(Debug, Default)]
struct InventoryState {
    labels: HashMap<String, BTreeSet<String>>,
    attributes: HashMap<String, HashMap<String, String>>,
    stable_versions: HashMap<String, String>,
}

/// Process-local inventory.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    state: Mutex<InventoryState>,
}

impl InMemoryInventory {
    /// Creates an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host with initial labels.
    #[must_use]
    pub fn with_host<I, S>(self, hostname: &str, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .labels
            .entry(hostname.to_string())
            .or_default()
            .extend(labels.into_iter().map(Into::into));
        self
    }

    /// Sets the stable version for a board.
    #[must_use]
    pub fn with_stable_version(self, board: &str, version: &str) -> Self {
        self.lock()
            .stable_versions
            .insert(board.to_string(), version.to_string());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InventoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inventory for InMemoryInventory {
    fn has_host(&self, hostname: &str) -> Result<bool, HostError> {
        Ok(self.lock().labels.contains_key(hostname))
    }

    fn labels(&self, hostname: &str) -> Result<Vec<String>, HostError> {
        Ok(self
            .lock()
            .labels
            .get(hostname)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn add_label(&self, hostname: &str, label: &str) -> Result<(), HostError> {
        self.lock()
            .labels
            .entry(hostname.to_string())
            .or_default()
            .insert(label.to_string());
        Ok(())
    }

    fn remove_label(&self, hostname: &str, label: &str) -> Result<(), HostError> {
        if let Some(labels) = self.lock().labels.get_mut(hostname) {
            labels.remove(label);
        }
        Ok(())
    }

    fn set_attribute(
        &self,
        hostname: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), HostError> {
        let mut state = self.lock();
        let attributes = state.attributes.entry(hostname.to_string()).or_default();
        match value {
            Some(value) => {
                attributes.insert(key.to_string(), value.to_string());
            },
            None => {
                attributes.remove(key);
            },
        }
        Ok(())
    }

    fn attribute(&self, hostname: &str, key: &str) -> Result<Option<String>, HostError> {
        Ok(self
            .lock()
            .attributes
            .get(hostname)
            .and_then(|a| a.get(key).cloned()))
    }
}

impl StableVersionSource for InMemoryInventory {
    fn stable_version(&self, board: &str) -> Result<String, HostError> {
        self.lock()
            .stable_versions
            .get(board)
            .cloned()
            .ok_or_else(|| HostError::infra(format!("no stable version for board {board}")))
    }
}

#[derive(Debug, Deserialize)]
struct LabelRecord {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AttributeRecord {
    value: String,
}

/// Inventory frontend reached over JSON-RPC.
///
/// Methods take keyword arguments, passed as a single object in a one-element
/// params array.
#[derive(Debug)]
pub struct AfeClient {
    proxy: RpcProxy,
}

impl AfeClient {
    /// Creates a client for the frontend at `url`.
    pub fn new(url: impl Into<String>) -> Result<Self, HostError> {
        Ok(Self {
            proxy: RpcProxy::new(url)?,
        })
    }

    fn run(&self, method: &str, kwargs: Value) -> Result<Value, HostError> {
        Ok(self.proxy.call(method, json!([kwargs]))?)
    }

    fn decode<T: for<'de> Deserialize<'de>>(method: &str, value: Value) -> Result<T, HostError> {
        serde_json::from_value(value).map_err(|e| {
            HostError::infra(format!("unexpected {method} response from inventory: {e}"))
        })
    }
}

impl Inventory for AfeClient {
    fn has_host(&self, hostname: &str) -> Result<bool, HostError> {
        let hosts = self.run("get_hosts", json!({ "hostname": hostname }))?;
        Ok(hosts.as_array().is_some_and(|h| !h.is_empty()))
    }

    fn labels(&self, hostname: &str) -> Result<Vec<String>, HostError> {
        let value = self.run("get_labels", json!({ "host__hostname": hostname }))?;
        let records: Vec<LabelRecord> = Self::decode("get_labels", value)?;
        Ok(records.into_iter().map(|r| r.name).collect())
    }

    fn add_label(&self, hostname: &str, label: &str) -> Result<(), HostError> {
        self.run("label_add_hosts", json!({ "id": label, "hosts": [hostname] }))?;
        Ok(())
    }

    fn remove_label(&self, hostname: &str, label: &str) -> Result<(), HostError> {
        self.run("label_remove_hosts", json!({ "id": label, "hosts": [hostname] }))?;
        Ok(())
    }

    fn set_attribute(
        &self,
        hostname: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), HostError> {
        self.run(
            "set_host_attribute",
            json!({ "attribute": key, "value": value, "hostname": hostname }),
        )?;
        Ok(())
    }

    fn attribute(&self, hostname: &str, key: &str) -> Result<Option<String>, HostError> {
        let value = self.run(
            "get_host_attribute",
            json!({ "attribute": key, "hostname": hostname }),
        )?;
        let records: Vec<AttributeRecord> = Self::decode("get_host_attribute", value)?;
        Ok(records.into_iter().next().map(|r| r.value))
    }
}

impl StableVersionSource for AfeClient {
    fn stable_version(&self, board: &str) -> Result<String, HostError> {
        let value = self.run("get_stable_version", json!({ "board": board }))?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HostError::infra(format!("no stable version for board {board}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_removal_leaves_other_labels() {
        let inventory = InMemoryInventory::new().with_host(
            "dut1",
            ["board:link", "cros-version:link-release/R1-1.0.0", "servo"],
        );

        inventory.remove_labels_with_prefix("dut1", VERSION_PREFIX).unwrap();

        assert_eq!(
            inventory.labels("dut1").unwrap(),
            vec!["board:link".to_string(), "servo".to_string()]
        );
        assert_eq!(inventory.board("dut1").unwrap().as_deref(), Some("link"));
    }

    #[test]
    fn test_attribute_set_and_clear() {
        let inventory = InMemoryInventory::new().with_host("dut1", Vec::<String>::new());

        inventory.set_attribute("dut1", JOB_REPO_URL, Some("http://ds/static/x")).unwrap();
        assert_eq!(
            inventory.attribute("dut1", JOB_REPO_URL).unwrap().as_deref(),
            Some("http://ds/static/x")
        );

        inventory.set_attribute("dut1", JOB_REPO_URL, None).unwrap();
        assert_eq!(inventory.attribute("dut1", JOB_REPO_URL).unwrap(), None);
    }

    #[test]
    fn test_stable_version_missing_board_is_infra() {
        let inventory = InMemoryInventory::new().with_stable_version("link", "R50-7978.0.0");

        assert_eq!(inventory.stable_version("link").unwrap(), "R50-7978.0.0");
        assert!(matches!(
            inventory.stable_version("samus"),
            Err(HostError::Infra { .. })
        ));
    }
}

//! Fakes shared by the integration tests.
//!
//! [`SimDut`] answers the shell commands the core issues the way a ChromeOS
//! test image does: A/B kernel slots flip on reboot after an update, stateful
//! markers disappear after a stateful update, and so on. Its state lives
//! behind an `Arc` so a test can inspect it after handing the transport to a
//! `CrosHost`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use labhost_core::clock::ManualClock;
use labhost_core::devserver::{ImageServer, ImageServerPool};
use labhost_core::firmware::ArtifactFetcher;
use labhost_core::inventory::InMemoryInventory;
use labhost_core::rpm::{PowerManager, PowerState};
use labhost_core::servo::Servo;
use labhost_core::transport::{BOOT_ID_PATH, CommandResult, REBOOT_COMMAND, RunOptions, Transport};
use labhost_core::update::image::url_to_image_name;
use labhost_core::{CrosHost, CrosHostBuilder, HostError};

pub const HOSTNAME: &str = "chromeos1-row1-rack1-host1";
pub const BOARD: &str = "lumpy";
pub const RUNNING_BUILD: &str = "lumpy-release/R27-3837.0.0";
pub const NEW_BUILD: &str = "lumpy-release/R28-4100.0.0";
pub const STABLE_VERSION: &str = "R28-4100.0.0";

/// An inventory that knows the test host and the board's stable version.
pub fn lab_inventory(labels: &[&str]) -> Arc<InMemoryInventory> {
    Arc::new(
        InMemoryInventory::new()
            .with_host(HOSTNAME, labels.iter().copied())
            .with_stable_version(BOARD, STABLE_VERSION),
    )
}

/// A host wired to the given fakes and a manual clock.
pub fn host_builder(
    dut: &SimDut,
    pool: &Arc<FakePool>,
    inventory: &Arc<InMemoryInventory>,
) -> CrosHostBuilder {
    CrosHost::builder(HOSTNAME)
        .transport(Box::new(dut.clone()))
        .inventory(inventory.clone())
        .stable_versions(inventory.clone())
        .devservers(pool.clone())
        .clock(Arc::new(ManualClock::new()))
}

/// Mutable state of a simulated DUT.
#[derive(Debug)]
pub struct DutState {
    pub board: String,
    pub builder_path: String,
    pub release_version: String,
    pub slot_b_active: bool,
    pub pending_image: Option<String>,
    pub boot_count: u32,
    pub reachable: bool,
    pub free_mb: u64,
    pub factory_image: bool,
    pub stateful_markers: bool,
    pub commands: Vec<String>,
    pub root_writes: Vec<String>,
    pub stateful_writes: usize,
    /// Update URL prefix → number of root updates from it that fail.
    pub failing_sources: HashMap<String, u32>,
}

impl DutState {
    fn lsb_release(&self) -> String {
        format!(
            "CHROMEOS_RELEASE_BOARD={}\nCHROMEOS_RELEASE_VERSION={}\nCHROMEOS_RELEASE_BUILDER_PATH={}\n",
            self.board, self.release_version, self.builder_path
        )
    }

    fn reboot(&mut self) {
        self.boot_count += 1;
        if let Some(image) = self.pending_image.take() {
            self.slot_b_active = !self.slot_b_active;
            self.release_version = image
                .rsplit('/')
                .next()
                .and_then(|v| v.split_once('-'))
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            self.builder_path = image;
        }
    }

    fn root_update(&mut self, omaha_url: &str) -> (String, i32) {
        self.root_writes.push(omaha_url.to_string());
        for (prefix, remaining) in &mut self.failing_sources {
            if *remaining > 0 && omaha_url.starts_with(prefix.as_str()) {
                *remaining -= 1;
                return ("Update failed: devserver stopped responding".to_string(), 1);
            }
        }
        self.pending_image = Some(url_to_image_name(omaha_url).to_string());
        (String::new(), 0)
    }

    fn priority(&self, kernel: u32) -> u32 {
        let active_kernel = if self.slot_b_active { 4 } else { 2 };
        let active_is_preferred = self.pending_image.is_none();
        if (kernel == active_kernel) == active_is_preferred {
            2
        } else {
            1
        }
    }

    fn answer(&mut self, command: &str) -> (String, String, i32) {
        let ok = |stdout: String| (stdout, String::new(), 0);
        if command == format!("cat {BOOT_ID_PATH}") {
            return ok(format!("boot-{}", self.boot_count));
        }
        if command == REBOOT_COMMAND {
            self.reboot();
            return ok(String::new());
        }
        if let Some(url) = command.strip_prefix("update_engine_client --update --omaha_url=") {
            let (stderr, status) = self.root_update(url);
            return (String::new(), stderr, status);
        }
        if command.starts_with("/usr/local/bin/stateful_update ") {
            self.stateful_writes += 1;
            self.stateful_markers = false;
            return ok(String::new());
        }
        if command.starts_with("touch ") && command.contains(".test_file_to_be_deleted") {
            self.stateful_markers = true;
            return ok(String::new());
        }
        if command.starts_with("test -f ") {
            return ok(if self.stateful_markers { "0" } else { "1" }.to_string());
        }
        if command.starts_with("cgpt show -n -i ") {
            let kernel = command
                .split_whitespace()
                .nth(4)
                .and_then(|k| k.parse().ok())
                .unwrap_or(0);
            return ok(self.priority(kernel).to_string());
        }
        if command == "[ -f /root/.factory_test ]" {
            return (String::new(), String::new(), i32::from(!self.factory_image));
        }
        if command.starts_with("find -L ") {
            return (String::new(), String::new(), 1);
        }
        match command {
            "cat /etc/lsb-release" => ok(self.lsb_release()),
            "update_engine_client --status 2>&1" => ok(if self.pending_image.is_some() {
                "CURRENT_OP=UPDATE_STATUS_UPDATED_NEED_REBOOT\n".to_string()
            } else {
                "CURRENT_OP=UPDATE_STATUS_IDLE\n".to_string()
            }),
            "rootdev -s" => ok(if self.slot_b_active { "/dev/sda5" } else { "/dev/sda3" }.to_string()),
            "rootdev -s -d" => ok("/dev/sda".to_string()),
            "crossystem fwid" => ok("Google_Lumpy.2.0.0".to_string()),
            "df -PB 1000000 /mnt/stateful_partition | tail -1" => ok(format!(
                "/dev/sda1 60000 {} {} 10% /mnt/stateful_partition",
                60_000_u64.saturating_sub(self.free_mb),
                self.free_mb
            )),
            "status system-services | grep start/running" => {
                ok("system-services start/running, process 1".to_string())
            },
            _ => ok(String::new()),
        }
    }
}

/// A transport backed by [`DutState`].
#[derive(Debug, Clone)]
pub struct SimDut {
    hostname: String,
    state: Arc<Mutex<DutState>>,
}

impl SimDut {
    /// A reachable DUT on `build`.
    pub fn new(build: &str) -> Self {
        let release_version = build
            .rsplit('/')
            .next()
            .and_then(|v| v.split_once('-'))
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();
        Self {
            hostname: HOSTNAME.to_string(),
            state: Arc::new(Mutex::new(DutState {
                board: BOARD.to_string(),
                builder_path: build.to_string(),
                release_version,
                slot_b_active: false,
                pending_image: None,
                boot_count: 0,
                reachable: true,
                free_mb: 40_000,
                factory_image: false,
                stateful_markers: false,
                commands: Vec::new(),
                root_writes: Vec::new(),
                stateful_writes: 0,
                failing_sources: HashMap::new(),
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, DutState> {
        self.state.lock().unwrap()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub fn fail_root_updates_from(&self, url_prefix: &str, times: u32) {
        self.state()
            .failing_sources
            .insert(url_prefix.to_string(), times);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn ran(&self, command: &str) -> bool {
        self.state().commands.iter().any(|c| c == command)
    }
}

impl Transport for SimDut {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn run_with(&self, command: &str, options: &RunOptions) -> Result<CommandResult, HostError> {
        let mut state = self.state();
        if !state.reachable {
            return Err(HostError::transport(&self.hostname, "Connection timed out"));
        }
        state.commands.push(command.to_string());
        let (stdout, stderr, exit_status) = state.answer(command);
        let result = CommandResult {
            command: command.to_string(),
            stdout,
            stderr,
            exit_status,
            duration: Duration::ZERO,
        };
        if options.ignore_status {
            Ok(result)
        } else {
            result.check()
        }
    }

    fn is_up(&self, _: Duration) -> bool {
        self.state().reachable
    }

    fn wait_up(&self, _: Duration) -> bool {
        self.state().reachable
    }

    fn wait_down(&self, _: Duration, _: Option<&str>) -> bool {
        true
    }

    fn get_file(&self, _: &str, _: &Path) -> Result<(), HostError> {
        Ok(())
    }
}

/// A devserver that records what was staged on it and which package URLs
/// were handed out.
#[derive(Debug)]
pub struct FakeDevserver {
    url: String,
    pub staged: Mutex<Vec<String>>,
    pub packaged: Mutex<Vec<String>>,
}

impl FakeDevserver {
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            staged: Mutex::new(Vec::new()),
            packaged: Mutex::new(Vec::new()),
        })
    }
}

impl ImageServer for FakeDevserver {
    fn url(&self) -> &str {
        &self.url
    }

    fn stage_artifacts(&self, image: &str, artifacts: &[&str]) -> Result<(), HostError> {
        self.staged
            .lock()
            .unwrap()
            .push(format!("{image}:{}", artifacts.join(",")));
        Ok(())
    }

    fn trigger_download(&self, image: &str, _: bool) -> Result<(), HostError> {
        self.staged.lock().unwrap().push(format!("{image}:update"));
        Ok(())
    }

    fn package_url(&self, image: &str) -> String {
        self.packaged.lock().unwrap().push(image.to_string());
        format!("{}/static/{image}/autotest/packages", self.url)
    }
}

/// Hands out its devservers in order, one per `resolve`, repeating the last.
#[derive(Debug)]
pub struct FakePool {
    servers: Vec<Arc<FakeDevserver>>,
    unhealthy: Mutex<Vec<String>>,
    resolves: AtomicUsize,
}

impl FakePool {
    pub fn new(urls: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            servers: urls.iter().map(|url| FakeDevserver::new(url)).collect(),
            unhealthy: Mutex::new(Vec::new()),
            resolves: AtomicUsize::new(0),
        })
    }

    pub fn mark_unhealthy(&self, url: &str) {
        self.unhealthy.lock().unwrap().push(url.to_string());
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn devserver(&self, index: usize) -> &FakeDevserver {
        &self.servers[index]
    }
}

impl ImageServerPool for FakePool {
    fn resolve(&self, _: &str) -> Result<Arc<dyn ImageServer>, HostError> {
        let n = self.resolves.fetch_add(1, Ordering::SeqCst);
        let server = self
            .servers
            .get(n.min(self.servers.len().saturating_sub(1)))
            .ok_or_else(|| HostError::infra("no devservers"))?;
        Ok(Arc::clone(server) as Arc<dyn ImageServer>)
    }

    fn is_healthy(&self, url: &str) -> bool {
        !self.unhealthy.lock().unwrap().iter().any(|u| u == url)
    }

    fn server(&self, url: &str) -> Arc<dyn ImageServer> {
        FakeDevserver::new(url)
    }
}

/// Records servo controls. Powering on makes `dut` reachable.
#[derive(Debug)]
pub struct FakeServo {
    pub dut: Option<SimDut>,
    pub sets: Arc<Mutex<Vec<String>>>,
    /// Contents of the images handed to `program_ec` and `program_bios`.
    pub flashed: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl FakeServo {
    pub fn new(dut: Option<SimDut>) -> Self {
        Self {
            dut,
            sets: Arc::new(Mutex::new(Vec::new())),
            flashed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record_flash(&self, image: &Path) -> Result<(), HostError> {
        let contents = std::fs::read_to_string(image)
            .map_err(|e| HostError::io("reading firmware image", e))?;
        self.flashed
            .lock()
            .unwrap()
            .push((image.file_name().unwrap().into(), contents));
        Ok(())
    }
}

impl Servo for FakeServo {
    fn set(&self, control: &str, value: &str) -> Result<(), HostError> {
        self.sets.lock().unwrap().push(format!("{control}:{value}"));
        if control == "power_state" && value == "on" {
            if let Some(dut) = &self.dut {
                dut.set_reachable(true);
            }
        }
        Ok(())
    }

    fn get(&self, control: &str) -> Result<String, HostError> {
        Ok(if control == "ec_board" { BOARD } else { "" }.to_string())
    }

    fn program_ec(&self, image: &Path) -> Result<(), HostError> {
        self.record_flash(image)
    }

    fn program_bios(&self, image: &Path) -> Result<(), HostError> {
        self.record_flash(image)
    }
}

/// Records outlet requests. Cycling or turning on makes `dut` reachable.
#[derive(Debug, Clone, Default)]
pub struct FakePower {
    pub dut: Option<SimDut>,
    pub requests: Arc<Mutex<Vec<PowerState>>>,
}

impl PowerManager for FakePower {
    fn set_power(&self, _: &str, state: PowerState) -> Result<(), HostError> {
        self.requests.lock().unwrap().push(state);
        if let Some(dut) = &self.dut {
            dut.set_reachable(state != PowerState::Off);
        }
        Ok(())
    }
}

/// Serves every URL from one local file.
#[derive(Debug)]
pub struct FileFetcher {
    pub source: PathBuf,
    pub urls: Mutex<Vec<String>>,
}

impl ArtifactFetcher for FileFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), HostError> {
        self.urls.lock().unwrap().push(url.to_string());
        std::fs::copy(&self.source, dest).map_err(|e| HostError::io("copying fixture", e))?;
        Ok(())
    }
}

//! Tunnel bookkeeping across arbitrary setup/disconnect sequences, and the
//! lifecycle of a real forwarding process.

mod common;

use std::collections::BTreeSet;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use common::{RUNNING_BUILD, SimDut};
use labhost_core::HostError;
use labhost_core::tunnel::{Forwarder, TunnelLauncher, TunnelManager};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use proptest::prelude::*;

#[derive(Debug)]
struct FlagForwarder {
    alive: Arc<AtomicBool>,
}

impl Forwarder for FlagForwarder {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> std::io::Result<bool> {
        Ok(!self.alive.load(Ordering::SeqCst))
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out flag forwarders and keeps every flag it created.
#[derive(Debug, Default, Clone)]
struct FlagLauncher {
    launched: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl FlagLauncher {
    fn live(&self) -> usize {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .filter(|alive| alive.load(Ordering::SeqCst))
            .count()
    }
}

impl TunnelLauncher for FlagLauncher {
    fn launch(&self, _: &str, _: u16, _: u16) -> Result<Box<dyn Forwarder>, HostError> {
        let alive = Arc::new(AtomicBool::new(true));
        self.launched.lock().unwrap().push(Arc::clone(&alive));
        Ok(Box::new(FlagForwarder { alive }))
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Setup(u16),
    Disconnect(u16),
    DisconnectAll,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (9990u16..9994).prop_map(Op::Setup),
        2 => (9990u16..9994).prop_map(Op::Disconnect),
        1 => Just(Op::DisconnectAll),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every tracked port owns exactly one live forwarder, and nothing else
    /// is left running.
    #[test]
    fn prop_one_live_forwarder_per_port(ops in prop::collection::vec(arb_op(), 1..24)) {
        let dut = SimDut::new(RUNNING_BUILD);
        let launcher = FlagLauncher::default();
        let mut tunnels = TunnelManager::new(Box::new(launcher.clone()));
        let mut expected = BTreeSet::new();

        for op in ops {
            match op {
                Op::Setup(port) => {
                    let url = tunnels.setup(&dut, port, None, None).unwrap();
                    prop_assert!(url.starts_with("http://localhost:"));
                    expected.insert(port);
                },
                Op::Disconnect(port) => {
                    tunnels.disconnect(&dut, port).unwrap();
                    expected.remove(&port);
                },
                Op::DisconnectAll => {
                    tunnels.disconnect_all(&dut).unwrap();
                    expected.clear();
                },
            }
            prop_assert_eq!(tunnels.ports().collect::<BTreeSet<_>>(), expected.clone());
            prop_assert_eq!(launcher.live(), tunnels.len());
        }
    }
}

/// Spawns `sleep` in place of ssh.
struct SleepLauncher;

impl TunnelLauncher for SleepLauncher {
    fn launch(&self, _: &str, _: u16, _: u16) -> Result<Box<dyn Forwarder>, HostError> {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| HostError::io("spawning sleep", e))?;
        Ok(Box::new(child))
    }
}

fn process_exists(pid: u32) -> bool {
    kill(Pid::from_raw(i32::try_from(pid).unwrap()), None).is_ok()
}

#[test]
fn test_disconnect_stops_forwarding_process() {
    let dut = SimDut::new(RUNNING_BUILD);
    let mut tunnels = TunnelManager::new(Box::new(SleepLauncher));

    tunnels.setup(&dut, 9992, None, None).unwrap();
    let pid = tunnels.get(9992).unwrap().forwarder_pid().unwrap();
    assert!(process_exists(pid));

    tunnels.disconnect(&dut, 9992).unwrap();

    assert!(!tunnels.contains(9992));
    assert!(!process_exists(pid));
}

#[test]
fn test_replacing_tunnel_stops_previous_process() {
    let dut = SimDut::new(RUNNING_BUILD);
    let mut tunnels = TunnelManager::new(Box::new(SleepLauncher));

    tunnels.setup(&dut, 9992, None, None).unwrap();
    let first = tunnels.get(9992).unwrap().forwarder_pid().unwrap();
    tunnels.setup(&dut, 9992, None, None).unwrap();
    let second = tunnels.get(9992).unwrap().forwarder_pid().unwrap();

    assert_ne!(first, second);
    assert!(!process_exists(first));
    assert!(process_exists(second));
    assert_eq!(tunnels.len(), 1);

    tunnels.disconnect_all(&dut).unwrap();
    assert!(!process_exists(second));
}

#[test]
fn test_remote_server_is_killed_by_name() {
    let dut = SimDut::new(RUNNING_BUILD);
    let mut tunnels = TunnelManager::new(Box::new(FlagLauncher::default()));

    tunnels
        .setup(&dut, 9990, Some("/usr/local/autotest/bin/rpc_server.py"), None)
        .unwrap();
    tunnels.disconnect(&dut, 9990).unwrap();

    assert!(dut.ran("pkill -f '/usr/local/autotest/bin/rpc_server.py'"));
}

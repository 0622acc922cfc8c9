//! `machine_install` against a simulated DUT.
//!
//! The real `ChromiumOsUpdater` drives [`common::SimDut`], so these tests
//! cover the command sequence as well as the orchestration: the no-op short
//! circuit, the stateful fast path, the full A/B update and devserver
//! failover.

mod common;

use common::{
    FakePool, HOSTNAME, NEW_BUILD, RUNNING_BUILD, SimDut, host_builder, lab_inventory,
};
use labhost_core::inventory::{Inventory, JOB_REPO_URL};
use labhost_core::{HostError, InstallOutcome, InstallRequest};

const DS1: &str = "http://ds1:8082";
const DS2: &str = "http://ds2:8082";

#[test]
fn test_already_installed_makes_no_writes() {
    let dut = SimDut::new(RUNNING_BUILD);
    let pool = FakePool::new(&[DS1]);
    let inventory = lab_inventory(&["board:lumpy"]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let outcome = host
        .machine_install(&InstallRequest::new().image(RUNNING_BUILD))
        .unwrap();

    assert_eq!(outcome, InstallOutcome::AlreadyInstalled);
    let state = dut.state();
    assert!(state.root_writes.is_empty());
    assert_eq!(state.stateful_writes, 0);
    assert_eq!(state.boot_count, 0);
    drop(state);
    assert!(
        inventory
            .labels(HOSTNAME)
            .unwrap()
            .contains(&format!("cros-version:{RUNNING_BUILD}"))
    );
}

#[test]
fn test_forced_update_of_running_release_is_stateful_only() {
    let dut = SimDut::new(RUNNING_BUILD);
    let pool = FakePool::new(&[DS1]);
    let inventory = lab_inventory(&["board:lumpy"]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let outcome = host
        .machine_install(
            &InstallRequest::new()
                .image(RUNNING_BUILD)
                .force_update(true),
        )
        .unwrap();

    assert_eq!(outcome, InstallOutcome::StatefulUpdate);
    let state = dut.state();
    assert!(state.root_writes.is_empty());
    assert_eq!(state.stateful_writes, 1);
    assert_eq!(state.boot_count, 1);
}

#[test]
fn test_force_full_update_skips_stateful_path() {
    let dut = SimDut::new(RUNNING_BUILD);
    let pool = FakePool::new(&[DS1]);
    let inventory = lab_inventory(&["board:lumpy"]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let outcome = host
        .machine_install(
            &InstallRequest::new()
                .image(RUNNING_BUILD)
                .force_update(true)
                .force_full_update(true),
        )
        .unwrap();

    assert_eq!(outcome, InstallOutcome::FullUpdate);
    assert_eq!(dut.state().root_writes.len(), 1);
}

#[test]
fn test_full_update_boots_other_kernel_and_relabels() {
    let dut = SimDut::new(RUNNING_BUILD);
    let pool = FakePool::new(&[DS1]);
    let inventory = lab_inventory(&["board:lumpy", format!("cros-version:{RUNNING_BUILD}").as_str()]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let outcome = host
        .machine_install(&InstallRequest::new().image(NEW_BUILD))
        .unwrap();

    assert_eq!(outcome, InstallOutcome::FullUpdate);
    {
        let state = dut.state();
        assert_eq!(state.root_writes, vec![format!("{DS1}/update/{NEW_BUILD}")]);
        assert!(state.slot_b_active);
        assert_eq!(state.builder_path, NEW_BUILD);
        assert_eq!(state.boot_count, 2);
    }
    assert!(dut.ran("start autoreboot"));

    let labels = inventory.labels(HOSTNAME).unwrap();
    assert!(labels.contains(&format!("cros-version:{NEW_BUILD}")));
    assert!(!labels.contains(&format!("cros-version:{RUNNING_BUILD}")));
    assert_eq!(
        inventory.attribute(HOSTNAME, JOB_REPO_URL).unwrap(),
        Some(format!("{DS1}/static/{NEW_BUILD}/autotest/packages"))
    );
    assert_eq!(*pool.devserver(0).packaged.lock().unwrap(), [NEW_BUILD]);
}

#[test]
fn test_unhealthy_devserver_is_replaced() {
    let dut = SimDut::new(RUNNING_BUILD);
    dut.fail_root_updates_from(DS1, 1);
    let pool = FakePool::new(&[DS1, DS2]);
    pool.mark_unhealthy(DS1);
    let inventory = lab_inventory(&["board:lumpy"]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let outcome = host
        .machine_install(&InstallRequest::new().image(NEW_BUILD))
        .unwrap();

    assert_eq!(outcome, InstallOutcome::FullUpdate);
    assert_eq!(
        dut.state().root_writes,
        vec![
            format!("{DS1}/update/{NEW_BUILD}"),
            format!("{DS2}/update/{NEW_BUILD}"),
        ]
    );
    assert_eq!(
        *pool.devserver(1).staged.lock().unwrap(),
        vec![format!("{NEW_BUILD}:update")]
    );
    assert!(
        inventory
            .attribute(HOSTNAME, JOB_REPO_URL)
            .unwrap()
            .is_some_and(|url| url.starts_with(DS2))
    );
}

#[test]
fn test_healthy_devserver_failure_is_not_retried() {
    let dut = SimDut::new(RUNNING_BUILD);
    dut.fail_root_updates_from(DS1, 1);
    let pool = FakePool::new(&[DS1, DS2]);
    let inventory = lab_inventory(&["board:lumpy", format!("cros-version:{RUNNING_BUILD}").as_str()]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let err = host
        .machine_install(&InstallRequest::new().image(NEW_BUILD))
        .unwrap_err();

    assert!(matches!(err, HostError::CommandFailed { .. }), "{err}");
    assert_eq!(dut.state().root_writes.len(), 1);
    assert_eq!(pool.resolves(), 1);
    // Markers are cleared before the install starts and stay cleared.
    assert_eq!(inventory.labels(HOSTNAME).unwrap(), vec!["board:lumpy"]);
    assert_eq!(inventory.attribute(HOSTNAME, JOB_REPO_URL).unwrap(), None);
}

#[test]
fn test_repair_install_uses_stable_version() {
    let dut = SimDut::new(RUNNING_BUILD);
    let pool = FakePool::new(&[DS1]);
    let inventory = lab_inventory(&["board:lumpy"]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let outcome = host.machine_install(&InstallRequest::repair()).unwrap();

    assert_eq!(outcome, InstallOutcome::FullUpdate);
    assert_eq!(dut.state().builder_path, NEW_BUILD);
}

#[test]
fn test_repair_without_board_label_is_infra() {
    let dut = SimDut::new(RUNNING_BUILD);
    let pool = FakePool::new(&[DS1]);
    let inventory = lab_inventory(&[]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let err = host.machine_install(&InstallRequest::repair()).unwrap_err();

    assert!(matches!(err, HostError::Infra { .. }), "{err}");
    assert!(dut.commands().is_empty());
}

#[test]
fn test_install_without_target_is_infra() {
    let dut = SimDut::new(RUNNING_BUILD);
    let pool = FakePool::new(&[DS1]);
    let inventory = lab_inventory(&["board:lumpy"]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();

    let err = host.machine_install(&InstallRequest::new()).unwrap_err();

    assert!(matches!(err, HostError::Infra { .. }), "{err}");
    assert_eq!(pool.resolves(), 0);
}

#[test]
fn test_explicit_update_url_is_used_verbatim() {
    let dut = SimDut::new(RUNNING_BUILD);
    let pool = FakePool::new(&[DS1]);
    let inventory = lab_inventory(&["board:lumpy"]);
    let host = host_builder(&dut, &pool, &inventory).build().unwrap();
    let url = format!("http://other:8082/update/{NEW_BUILD}");

    let outcome = host
        .machine_install(&InstallRequest::new().update_url(url.clone()))
        .unwrap();

    assert_eq!(outcome, InstallOutcome::FullUpdate);
    assert_eq!(dut.state().root_writes, vec![url]);
}

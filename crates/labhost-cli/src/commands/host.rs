//! Host maintenance commands: repair, install, verify, ping-wait, labels.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use labhost_core::{CrosHost, InstallRequest, LabConfig, OutcomeKind};

fn connect(hostname: &str, config: LabConfig) -> Result<CrosHost> {
    CrosHost::builder(hostname)
        .config(config)
        .build()
        .with_context(|| format!("failed to set up host {hostname}"))
}

/// Builds an install request from command-line flags.
pub fn install_request(
    image: Option<String>,
    update_url: Option<String>,
    repair: bool,
    force_update: bool,
    force_full_update: bool,
) -> InstallRequest {
    let mut request = if repair {
        InstallRequest::repair()
    } else {
        InstallRequest::new()
    };
    request.image = image;
    request.update_url = update_url;
    request
        .force_update(force_update)
        .force_full_update(force_full_update)
}

/// Repairs a host and prints what each action did.
pub fn repair(hostname: &str, config: LabConfig) -> Result<()> {
    let mut host = connect(hostname, config)?;
    let report = host
        .repair_full()
        .with_context(|| format!("failed to repair {hostname}"))?;

    for outcome in &report.outcomes {
        let kind = match outcome.kind {
            OutcomeKind::Succeeded => "succeeded",
            OutcomeKind::NotApplicable => "not applicable",
            OutcomeKind::Failed => "failed",
        };
        println!(
            "{:<24} {:<16} {}",
            outcome.action,
            kind,
            humantime::format_duration(Duration::from_secs(outcome.elapsed.as_secs()))
        );
    }
    Ok(())
}

/// Installs an image on a host.
pub fn install(hostname: &str, config: LabConfig, request: &InstallRequest) -> Result<()> {
    let host = connect(hostname, config)?;
    let outcome = host
        .machine_install(request)
        .with_context(|| format!("failed to install on {hostname}"))?;
    println!("{hostname}: {outcome:?}");
    Ok(())
}

/// Runs the health check used by repair.
pub fn verify(hostname: &str, config: LabConfig) -> Result<()> {
    let host = connect(hostname, config)?;
    host.check_device()
        .with_context(|| format!("{hostname} failed verification"))?;
    println!("{hostname}: ok");
    Ok(())
}

/// Waits for ping to succeed, or to stop succeeding.
pub fn ping_wait(hostname: &str, config: LabConfig, down: bool, timeout: Duration) -> Result<()> {
    let host = connect(hostname, config)?;
    let reached = if down {
        host.ping_wait_down(timeout)
    } else {
        host.ping_wait_up(timeout)
    };
    if !reached {
        bail!(
            "{hostname} did not go {} within {}",
            if down { "down" } else { "up" },
            humantime::format_duration(timeout)
        );
    }
    println!("{hostname}: {}", if down { "down" } else { "up" });
    Ok(())
}

/// Prints detected labels, one per line.
pub fn labels(hostname: &str, config: LabConfig) -> Result<()> {
    let host = connect(hostname, config)?;
    for label in host.labels() {
        println!("{label}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_request_from_flags() {
        let request = install_request(
            Some("lumpy-release/R28-4100.0.0".to_string()),
            None,
            false,
            true,
            false,
        );
        assert_eq!(request.image.as_deref(), Some("lumpy-release/R28-4100.0.0"));
        assert!(request.force_update);
        assert!(!request.repair);

        let repair = install_request(None, None, true, false, true);
        assert!(repair.repair);
        assert!(repair.force_full_update);
    }
}

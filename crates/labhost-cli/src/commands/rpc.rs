//! `rpc-connect`: start an RPC server on a device, call it once, tear down.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use labhost_core::{CrosHost, LabConfig, RpcLaunch};
use serde_json::Value;
use tracing::warn;

/// Arguments for `rpc-connect`.
#[derive(Args, Debug)]
pub struct RpcConnectArgs {
    /// Device hostname
    pub hostname: String,

    /// Command that runs the server in the foreground on the device
    #[arg(long)]
    pub command: String,

    /// Port the server listens on, on the device
    #[arg(long)]
    pub port: u16,

    /// Pattern used to find and stop the server on disconnect
    #[arg(long)]
    pub process_name: Option<String>,

    /// Zero-argument method that succeeds once the server is ready
    #[arg(long)]
    pub ready_method: Option<String>,

    /// Readiness budget
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Method to call once connected
    #[arg(long)]
    pub call: String,

    /// JSON parameters for the call
    #[arg(long, default_value = "[]")]
    pub params: String,
}

impl RpcConnectArgs {
    fn launch(&self) -> RpcLaunch {
        let mut launch = RpcLaunch::new(&self.command, self.port).timeout(self.timeout);
        if let Some(name) = &self.process_name {
            launch = launch.process_match_name(name);
        }
        if let Some(method) = &self.ready_method {
            launch = launch.readiness_probe(method);
        }
        launch
    }
}

/// Runs `rpc-connect` and prints the call's result as JSON.
pub fn run(args: &RpcConnectArgs, config: LabConfig) -> Result<()> {
    let params: Value = serde_json::from_str(&args.params).context("--params is not valid JSON")?;

    let mut host = CrosHost::builder(&args.hostname)
        .config(config)
        .build()
        .with_context(|| format!("failed to set up host {}", args.hostname))?;

    let result = host
        .rpc_connect(&args.launch())
        .with_context(|| format!("failed to start rpc server on {}", args.hostname))
        .and_then(|proxy| {
            proxy
                .call(&args.call, params)
                .with_context(|| format!("rpc call {} failed", args.call))
        });

    if let Err(e) = host.close() {
        warn!(hostname = %args.hostname, error = %e, "failed to tear down rpc tunnels");
    }

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_from_args() {
        let args = RpcConnectArgs {
            hostname: "dut".to_string(),
            command: "/usr/local/autotest/bin/rpc_server.py".to_string(),
            port: 9990,
            process_name: Some("rpc_server.py".to_string()),
            ready_method: Some("ready".to_string()),
            timeout: Duration::from_secs(30),
            call: "get_status".to_string(),
            params: "[]".to_string(),
        };

        let launch = args.launch();

        assert_eq!(launch.port, 9990);
        assert_eq!(launch.process_match_name.as_deref(), Some("rpc_server.py"));
        assert_eq!(launch.readiness_probe.as_deref(), Some("ready"));
        assert_eq!(launch.timeout, Duration::from_secs(30));
    }
}

//! labhost - lab device host management
//!
//! Repairs, installs, verifies and probes ChromeOS devices under test.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labhost_core::LabConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// labhost - lab device host management
#[derive(Parser, Debug)]
#[command(name = "labhost")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the lab configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run repair actions until the device passes its health check
    Repair {
        /// Device hostname
        hostname: String,
    },

    /// Install an image on the device
    Install {
        /// Device hostname
        hostname: String,

        /// Build to stage and install, e.g. `lumpy-release/R28-4100.0.0`
        #[arg(long, conflicts_with_all = ["update_url", "repair"])]
        image: Option<String>,

        /// Update URL to install from, used as-is
        #[arg(long, conflicts_with = "repair")]
        update_url: Option<String>,

        /// Install the board's stable image
        #[arg(long)]
        repair: bool,

        /// Install even if the device already runs the build
        #[arg(long)]
        force_update: bool,

        /// Always rewrite the root filesystem
        #[arg(long)]
        force_full_update: bool,
    },

    /// Clean up and verify the device
    Verify {
        /// Device hostname
        hostname: String,
    },

    /// Wait for the device to answer (or stop answering) ping
    PingWait {
        /// Device hostname
        hostname: String,

        /// Wait for the device to go down instead
        #[arg(long)]
        down: bool,

        /// How long to wait
        #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Print the labels detected on the device
    Labels {
        /// Device hostname
        hostname: String,
    },

    /// Start an RPC server on the device and call one method on it
    RpcConnect(commands::rpc::RpcConnectArgs),
}

fn load_config(path: Option<&PathBuf>) -> Result<LabConfig> {
    match path {
        Some(path) => LabConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(LabConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Repair { hostname } => commands::host::repair(&hostname, config),
        Commands::Install {
            hostname,
            image,
            update_url,
            repair,
            force_update,
            force_full_update,
        } => {
            let request = commands::host::install_request(
                image,
                update_url,
                repair,
                force_update,
                force_full_update,
            );
            commands::host::install(&hostname, config, &request)
        },
        Commands::Verify { hostname } => commands::host::verify(&hostname, config),
        Commands::PingWait {
            hostname,
            down,
            timeout,
        } => commands::host::ping_wait(&hostname, config, down, timeout),
        Commands::Labels { hostname } => commands::host::labels(&hostname, config),
        Commands::RpcConnect(args) => commands::rpc::run(&args, config),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_install_arguments() {
        let cli = Cli::try_parse_from([
            "labhost",
            "install",
            "chromeos1-row1-rack1-host1",
            "--image",
            "lumpy-release/R28-4100.0.0",
            "--force-update",
        ])
        .unwrap();

        let Commands::Install {
            image,
            force_update,
            force_full_update,
            ..
        } = cli.command
        else {
            panic!("expected install");
        };
        assert_eq!(image.as_deref(), Some("lumpy-release/R28-4100.0.0"));
        assert!(force_update);
        assert!(!force_full_update);
    }

    #[test]
    fn test_install_image_conflicts_with_repair() {
        let result = Cli::try_parse_from([
            "labhost",
            "install",
            "dut",
            "--image",
            "lumpy-release/R28-4100.0.0",
            "--repair",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_ping_wait_timeout_parses_humantime() {
        let cli =
            Cli::try_parse_from(["labhost", "ping-wait", "dut", "--down", "--timeout", "2m"])
                .unwrap();
        let Commands::PingWait { down, timeout, .. } = cli.command else {
            panic!("expected ping-wait");
        };
        assert!(down);
        assert_eq!(timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let missing = PathBuf::from("/nonexistent/labhost.toml");
        assert!(load_config(Some(&missing)).is_err());
        assert!(load_config(None).is_ok());
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon lifecycle commands
//!
//! Commands: run, status, config

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use shipyard_core::domain::daemon_config::DaemonConfigManifest;

use crate::config::CliConfig;
use crate::daemon::{check_daemon_running, run_daemon, DaemonStatus};

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (stop with Ctrl+C or SIGTERM)
    Run {
        /// Daemon configuration file (overrides discovery)
        #[arg(long = "daemon-config", env = "SHIPYARD_CONFIG_PATH", value_name = "FILE")]
        daemon_config: Option<PathBuf>,
    },

    /// Check whether the configured daemon answers
    Status,

    /// Validate a daemon configuration and print the effective settings
    Config {
        #[arg(long = "daemon-config", env = "SHIPYARD_CONFIG_PATH", value_name = "FILE")]
        daemon_config: Option<PathBuf>,
    },
}

pub async fn handle_command(
    command: DaemonCommand,
    config_path: Option<PathBuf>,
    log_level: Option<String>,
) -> Result<()> {
    match command {
        DaemonCommand::Run { daemon_config } => run_daemon(daemon_config, log_level).await,
        DaemonCommand::Status => status(config_path).await,
        DaemonCommand::Config { daemon_config } => show_config(daemon_config),
    }
}

async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let config = CliConfig::load_or_default(config_path)?;
    match check_daemon_running(&config.daemon_url).await? {
        DaemonStatus::Running { version, uptime } => {
            println!("{}", format!("✓ Daemon running at {}", config.daemon_url).green());
            println!("  Version: {}", version);
            println!("  Uptime:  {}s", uptime);
            Ok(())
        }
        DaemonStatus::Unreachable { error } => {
            println!("{}", format!("✗ Daemon not reachable at {}", config.daemon_url).red());
            println!("  {}", error.dimmed());
            anyhow::bail!("daemon is not running")
        }
    }
}

fn show_config(daemon_config: Option<PathBuf>) -> Result<()> {
    let config = DaemonConfigManifest::load_or_default(daemon_config)
        .context("Failed to load configuration")?;
    match config.validate() {
        Ok(()) => println!("{}", "✓ Configuration is valid".green()),
        Err(e) => {
            println!("{}", format!("✗ Configuration is invalid: {}", e).red());
            return Err(e);
        }
    }
    let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
    println!("{}", yaml);
    Ok(())
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # shipyard
//!
//! One binary for both sides of a self-hosted deployment:
//!
//! - **Daemon mode**: `shipyard daemon run` serves the signed command API, supervises
//!   containers and holds the daemon key pair
//! - **Operator mode**: every other command runs on the operator's machine, signing
//!   requests with the CLI identity and talking to servers over SSH
//!
//! ## Commands
//!
//! - `shipyard daemon run|status|config` - Daemon lifecycle
//! - `shipyard keys init|rotate|show|trust|revoke|identity` - Key management
//! - `shipyard fleet status|exec|upload|download|prepare|stage-credentials` - SSH fleet
//! - `shipyard app deploy|start|stop|restart|status|logs|list` - App operations
//! - `shipyard secrets check` - Secret delivery check

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use shipyard::commands::{
    self, AppCommand, DaemonCommand, FleetCommand, KeysCommand, SecretsCommand,
};
use shipyard::logging::init_logging;

/// shipyard - self-hosted deployment orchestrator
#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the CLI configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "SHIPYARD_CLI_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SHIPYARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format for operator commands (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or inspect the daemon
    #[command(name = "daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Daemon keys, trusted peers and the CLI identity
    #[command(name = "keys")]
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },

    /// Operate on the SSH fleet
    #[command(name = "fleet")]
    Fleet {
        #[command(subcommand)]
        command: FleetCommand,
    },

    /// Deploy and manage apps through the daemon
    #[command(name = "app")]
    App {
        #[command(subcommand)]
        command: AppCommand,
    },

    /// Secret delivery
    #[command(name = "secrets")]
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // The daemon configures logging from its own config file.
    let is_daemon_run = matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommand::Run { .. }
        }
    );
    if !is_daemon_run {
        init_logging(cli.log_level.as_deref().unwrap_or("warn"), &cli.log_format)?;
    }

    let result = match cli.command {
        Commands::Daemon { command } => {
            commands::daemon::handle_command(command, cli.config, cli.log_level).await
        }
        Commands::Keys { command } => commands::keys::handle_command(command, cli.config).await,
        Commands::Fleet { command } => commands::fleet::handle_command(command, cli.config).await,
        Commands::App { command } => commands::app::handle_command(command, cli.config).await,
        Commands::Secrets { command } => {
            commands::secrets::handle_command(command, cli.config).await
        }
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => match commands::remote_exit_code(&e) {
            Some(code) => Ok(ExitCode::from(code)),
            None => Err(e),
        },
    }
}

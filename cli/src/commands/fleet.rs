// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fleet commands over SSH
//!
//! Commands: status, exec, upload, download, prepare, stage-credentials

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use zeroize::Zeroizing;

use shipyard_core::application::remote_ops::{RemoteOperations, StagedCredentials};
use shipyard_core::domain::fleet::{FleetError, ServerConfig};
use shipyard_core::infrastructure::fleet::FleetManager;
use shipyard_core::infrastructure::ssh::Ssh2Connector;

use crate::commands::{cancel_on_ctrl_c, RemoteExit};
use crate::config::CliConfig;

#[derive(Subcommand)]
pub enum FleetCommand {
    /// Connect to every configured server and report the sessions
    Status,

    /// Run a shell command, streaming its output
    Exec {
        /// Target server
        #[arg(short, long, required_unless_present = "all")]
        server: Option<String>,

        /// Run on every configured server in parallel
        #[arg(long, conflicts_with = "server")]
        all: bool,

        #[arg(trailing_var_arg = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Copy a local file to a server over SFTP
    Upload {
        server: String,
        local: PathBuf,
        remote: String,
    },

    /// Copy a remote file to the local machine over SFTP
    Download {
        server: String,
        remote: String,
        local: PathBuf,
    },

    /// Install Docker, Caddy and base tools where missing
    Prepare {
        #[arg(short, long, required_unless_present = "all")]
        server: Option<String>,

        #[arg(long, conflicts_with = "server")]
        all: bool,
    },

    /// Write credentials to a server through stdin, never the command line
    StageCredentials {
        server: String,

        /// Docker registry to log in to; the password is read from stdin
        #[arg(long, conflicts_with = "file")]
        registry: Option<String>,

        #[arg(long, requires = "registry")]
        username: Option<String>,

        /// Local file whose contents are staged verbatim
        #[arg(long, requires = "remote_path")]
        file: Option<PathBuf>,

        /// Remote destination (relative paths resolve against the login user's home)
        #[arg(long)]
        remote_path: Option<String>,

        /// Write through sudo
        #[arg(long)]
        sudo: bool,
    },
}

pub async fn handle_command(command: FleetCommand, config_path: Option<PathBuf>) -> Result<()> {
    let config = CliConfig::load_or_default(config_path)?;
    let fleet = Arc::new(fleet_manager(&config));
    let cancel = cancel_on_ctrl_c();

    let result = match command {
        FleetCommand::Status => status(&config, &fleet).await,
        FleetCommand::Exec {
            server,
            all,
            command,
        } => {
            let targets = targets(&config, server.as_deref(), all)?;
            exec(&fleet, &targets, &command.join(" "), &cancel).await
        }
        FleetCommand::Upload {
            server,
            local,
            remote,
        } => {
            fleet.connect(config.server(&server)?).await?;
            let bytes = fleet.upload_file(&server, &local, &remote).await?;
            println!(
                "{}",
                format!("✓ Uploaded {} ({} bytes) to {}:{}", local.display(), bytes, server, remote).green()
            );
            Ok(())
        }
        FleetCommand::Download {
            server,
            remote,
            local,
        } => {
            fleet.connect(config.server(&server)?).await?;
            let bytes = fleet.download_file(&server, &remote, &local).await?;
            println!(
                "{}",
                format!("✓ Downloaded {}:{} ({} bytes) to {}", server, remote, bytes, local.display()).green()
            );
            Ok(())
        }
        FleetCommand::Prepare { server, all } => {
            let targets = targets(&config, server.as_deref(), all)?;
            prepare(&fleet, &targets, &cancel).await
        }
        FleetCommand::StageCredentials {
            server,
            registry,
            username,
            file,
            remote_path,
            sudo,
        } => {
            let mut creds = match (registry, file) {
                (Some(registry), None) => {
                    let username = username.context("--username is required with --registry")?;
                    let password = read_secret_line()?;
                    StagedCredentials::docker_registry(&registry, &username, &password)
                }
                (None, Some(file)) => {
                    let contents = std::fs::read(&file)
                        .with_context(|| format!("Failed to read {}", file.display()))?;
                    StagedCredentials::new(remote_path.clone().unwrap_or_default(), contents)
                }
                _ => anyhow::bail!("Pass either --registry or --file"),
            };
            if let Some(path) = remote_path {
                creds.remote_path = path;
            }
            creds.use_sudo = sudo;

            fleet.connect(config.server(&server)?).await?;
            RemoteOperations::new(fleet.as_ref())
                .stage_credentials(&server, &creds, &cancel)
                .await?;
            println!(
                "{}",
                format!("✓ Staged credentials at {}:{}", server, creds.remote_path).green()
            );
            Ok(())
        }
    };

    if let Err(e) = fleet.close_all().await {
        warn!(error = %e, "Failed to close SSH sessions cleanly");
    }
    result
}

fn fleet_manager(config: &CliConfig) -> FleetManager {
    let connector = Ssh2Connector::new(config.known_hosts_path.clone(), config.host_key_policy);
    FleetManager::new(Arc::new(connector))
}

fn targets(config: &CliConfig, server: Option<&str>, all: bool) -> Result<Vec<ServerConfig>> {
    if all {
        if config.servers.is_empty() {
            anyhow::bail!("No servers configured");
        }
        return Ok(config.servers.clone());
    }
    let name = server.context("Pass --server or --all")?;
    Ok(vec![config.server(name)?.clone()])
}

/// Connect to `targets`, printing failures. Returns the names that connected.
async fn connect(fleet: &FleetManager, targets: &[ServerConfig]) -> Vec<String> {
    let failed: Vec<String> = match fleet.connect_all(targets).await {
        Ok(()) => Vec::new(),
        Err(e) => {
            print_failure(&e);
            e.servers().into_iter().map(str::to_string).collect()
        }
    };
    targets
        .iter()
        .map(|t| t.name.clone())
        .filter(|name| !failed.contains(name))
        .collect()
}

fn print_failure(err: &FleetError) {
    match err {
        FleetError::Aggregate(failures) => {
            for (server, e) in failures {
                println!("{} {}: {}", "✗".red(), server, e);
            }
        }
        other => println!("{} {}", "✗".red(), other),
    }
}

async fn status(config: &CliConfig, fleet: &FleetManager) -> Result<()> {
    if config.servers.is_empty() {
        println!("{}", "No servers configured.".yellow());
        return Ok(());
    }
    let connected = connect(fleet, &config.servers).await;

    println!("{}", format!("{:<20} {:<30} CONNECTED", "NAME", "ADDRESS").bold());
    for session in fleet.list() {
        println!(
            "{:<20} {:<30} {}",
            session.name,
            format!("{}:{}", session.host, session.port),
            session.connected_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let failed = config.servers.len() - connected.len();
    if failed > 0 {
        anyhow::bail!("{} of {} server(s) unreachable", failed, config.servers.len());
    }
    Ok(())
}

async fn exec(
    fleet: &Arc<FleetManager>,
    targets: &[ServerConfig],
    command: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let connected = connect(fleet, targets).await;

    // a single server streams straight to the terminal
    if let [target] = targets {
        if connected.is_empty() {
            anyhow::bail!("Could not connect to {}", target.name);
        }
        let mut stdout = tokio::io::stdout();
        return match fleet.execute(&target.name, command, Some(&mut stdout), cancel).await {
            Ok(_) => Ok(()),
            Err(FleetError::CommandFailed { exit_status, .. }) => {
                println!("{}", format!("✗ exited with status {}", exit_status).red());
                Err(RemoteExit {
                    server: target.name.clone(),
                    status: exit_status,
                }
                .into())
            }
            Err(e) => Err(e.into()),
        };
    }

    // several servers run concurrently; output is printed per server once complete
    let runs = connected.iter().map(|name| {
        let fleet = Arc::clone(fleet);
        let cancel = cancel.clone();
        let name = name.clone();
        let command = command.to_string();
        tokio::spawn(async move {
            let result = fleet.execute(&name, &command, None, &cancel).await;
            (name, result)
        })
    });

    let mut failures = targets.len() - connected.len();
    for joined in futures::future::join_all(runs).await {
        let (name, result) = joined.context("Remote command task panicked")?;
        println!("{}", format!("== {} ==", name).bold());
        match result {
            Ok(output) => {
                print!("{}", output);
                println!("{}", "✓ ok".green());
            }
            Err(FleetError::CommandFailed {
                exit_status,
                output,
                ..
            }) => {
                print!("{}", output);
                println!("{}", format!("✗ exited with status {}", exit_status).red());
                failures += 1;
            }
            Err(e) => {
                println!("{} {}", "✗".red(), e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("Command failed on {} of {} server(s)", failures, targets.len());
    }
    Ok(())
}

async fn prepare(fleet: &FleetManager, targets: &[ServerConfig], cancel: &CancellationToken) -> Result<()> {
    let connected = connect(fleet, targets).await;
    let ops = &RemoteOperations::new(fleet);

    let reports = futures::future::join_all(
        connected
            .iter()
            .map(|name| async move { (name, ops.prepare_server(name, cancel).await) }),
    )
    .await;

    let mut failures = targets.len() - connected.len();
    for (name, result) in reports {
        match result {
            Ok(report) if report.already_prepared => {
                println!("{} {}: already prepared", "✓".green(), name);
                println!("    docker {}, caddy {}", report.docker_version, report.caddy_version);
            }
            Ok(report) => {
                let manager = report
                    .package_manager
                    .map(|pm| pm.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {}: installed {} via {}",
                    "✓".green(),
                    name,
                    report.installed.join(", "),
                    manager
                );
                println!("    docker {}, caddy {}", report.docker_version, report.caddy_version);
            }
            Err(e) => {
                println!("{} {}: {}", "✗".red(), name, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("Preparation failed on {} of {} server(s)", failures, targets.len());
    }
    Ok(())
}

fn read_secret_line() -> Result<Zeroizing<String>> {
    eprintln!("Reading password from stdin...");
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    if trimmed.is_empty() {
        anyhow::bail!("Empty password on stdin");
    }
    Ok(trimmed)
}

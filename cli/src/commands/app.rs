// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! App commands, delegated to the daemon as signed envelopes
//!
//! Commands: deploy, start, stop, restart, status, logs, list

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};
use std::path::PathBuf;

use shipyard_core::domain::envelope::{Command, Response};
use shipyard_core::domain::runtime::ContainerSummary;
use shipyard_core::domain::supervisor::{AppStatus, MonitoredApp, RestartPolicy};

use crate::commands::{collect_env, daemon_client, report, seal_for_daemon};
use crate::config::CliConfig;

#[derive(Subcommand)]
pub enum AppCommand {
    /// Deploy (or redeploy) a container and put it under supervision
    Deploy {
        name: String,

        #[arg(long)]
        image: String,

        /// Secret environment variable, encrypted to the daemon key
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// File of KEY=VALUE lines, encrypted to the daemon key
        #[arg(long, value_name = "FILE")]
        env_file: Option<PathBuf>,

        /// Port binding
        #[arg(short = 'p', long = "port", value_name = "HOST:CONTAINER")]
        ports: Vec<String>,

        /// always, on-failure or never
        #[arg(long, default_value = "always")]
        restart_policy: RestartPolicy,

        /// Restart cap (-1 for unlimited, daemon default when unset)
        #[arg(long, allow_hyphen_values = true)]
        max_restarts: Option<i32>,

        /// Public domain routed to the app through the reverse proxy
        #[arg(long)]
        domain: Option<String>,

        /// Host port the proxy forwards to (defaults to the first published port)
        #[arg(long, requires = "domain")]
        upstream_port: Option<u16>,
    },

    /// Start a stopped app
    Start { name: String },

    /// Stop an app and release it from supervision
    Stop { name: String },

    /// Restart an app and reset its restart counter
    Restart { name: String },

    /// Supervision status of one or all apps
    Status { name: Option<String> },

    /// Recent container log lines
    Logs {
        name: String,

        #[arg(short = 'n', long, default_value = "100")]
        tail: usize,
    },

    /// Containers managed by the daemon
    List,
}

pub async fn handle_command(command: AppCommand, config_path: Option<PathBuf>) -> Result<()> {
    let config = CliConfig::load_or_default(config_path)?;
    let client = daemon_client(&config)?;

    match command {
        AppCommand::Deploy {
            name,
            image,
            env,
            env_file,
            ports,
            restart_policy,
            max_restarts,
            domain,
            upstream_port,
        } => {
            let secrets = collect_env(&env, env_file.as_deref())?;
            let mut request = Command::new("deploy")
                .with_arg("name", name.as_str())
                .with_arg("image", image)
                .with_arg("restart_policy", restart_policy.to_string())
                .with_arg("ports", json!(ports));
            if !secrets.is_empty() {
                let sealed = seal_for_daemon(&config, &client, &secrets).await?;
                let sealed = serde_json::to_value(&sealed).context("Failed to encode secrets")?;
                request = request.with_arg("env", sealed);
            }
            if let Some(max) = max_restarts {
                request = request.with_arg("max_restarts", max);
            }
            if let Some(domain) = domain {
                request = request.with_arg("domain", domain);
            }
            if let Some(port) = upstream_port {
                request = request.with_arg("upstream_port", port);
            }

            println!("Deploying {}...", name.bold());
            let response = client.send(&request).await?;
            report(&response)?;
            if let Some(payload) = &response.payload {
                print_deployment(payload);
            }
            Ok(())
        }
        AppCommand::Start { name } => simple(&client, "start", &name).await,
        AppCommand::Stop { name } => simple(&client, "stop", &name).await,
        AppCommand::Restart { name } => simple(&client, "restart", &name).await,
        AppCommand::Status { name } => {
            let mut request = Command::new("status");
            if let Some(name) = name {
                request = request.with_arg("name", name);
            }
            let response = client.send(&request).await?;
            report(&response)?;
            print_apps(&response)
        }
        AppCommand::Logs { name, tail } => {
            let request = Command::new("logs")
                .with_arg("name", name)
                .with_arg("tail", tail);
            let response = client.send(&request).await?;
            if !response.success {
                return report(&response);
            }
            let lines = response
                .payload
                .as_ref()
                .and_then(|p| p["lines"].as_array())
                .cloned()
                .unwrap_or_default();
            for line in lines {
                println!("{}", line.as_str().unwrap_or_default());
            }
            Ok(())
        }
        AppCommand::List => {
            let response = client.send(&Command::new("list")).await?;
            report(&response)?;
            let containers: Vec<ContainerSummary> = match response.payload {
                Some(payload) => serde_json::from_value(payload).context("Unexpected list payload")?,
                None => Vec::new(),
            };
            if containers.is_empty() {
                return Ok(());
            }
            println!("{}", format!("{:<24} {:<40} STATUS", "NAME", "IMAGE").bold());
            for container in containers {
                println!("{:<24} {:<40} {}", container.name, container.image, container.status);
            }
            Ok(())
        }
    }
}

async fn simple(client: &crate::daemon::DaemonClient, kind: &str, name: &str) -> Result<()> {
    let response = client.send(&Command::new(kind).with_arg("name", name)).await?;
    report(&response)
}

fn print_deployment(payload: &Value) {
    if let Some(id) = payload["id"].as_str() {
        println!("  Container: {}", id);
    }
    if let Some(ports) = payload["ports"].as_array().filter(|p| !p.is_empty()) {
        let ports: Vec<&str> = ports.iter().filter_map(Value::as_str).collect();
        println!("  Ports:     {}", ports.join(", "));
    }
    if let Some(domain) = payload["domain"].as_str() {
        println!("  Domain:    {}", domain);
    }
}

fn print_apps(response: &Response) -> Result<()> {
    let apps: Vec<MonitoredApp> = match &response.payload {
        Some(payload) => serde_json::from_value(payload.clone()).context("Unexpected status payload")?,
        None => Vec::new(),
    };
    if apps.is_empty() {
        return Ok(());
    }

    println!(
        "{}",
        format!("{:<24} {:<12} {:<12} {:<10} LAST ERROR", "NAME", "STATUS", "POLICY", "RESTARTS").bold()
    );
    for app in apps {
        let cap = if app.max_restarts < 0 {
            "∞".to_string()
        } else {
            app.max_restarts.to_string()
        };
        let status = format!("{:?}", app.status).to_lowercase();
        let status = match app.status {
            AppStatus::Running => status.green(),
            AppStatus::Restarting | AppStatus::Unknown => status.yellow(),
            AppStatus::Stopped => status.normal(),
            AppStatus::Failed | AppStatus::Exhausted => status.red(),
        };
        println!(
            "{:<24} {:<12} {:<12} {:<10} {}",
            app.container_name,
            status,
            app.restart_policy.to_string(),
            format!("{}/{}", app.restart_count, cap),
            app.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

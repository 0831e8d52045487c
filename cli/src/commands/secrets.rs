// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Secret delivery check
//!
//! Seals a secret set to the daemon and asks it which variable names it could
//! decrypt. Values never come back.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use crate::commands::{collect_env, daemon_client, report, seal_for_daemon};
use crate::config::CliConfig;

#[derive(Subcommand)]
pub enum SecretsCommand {
    /// Verify that the daemon can decrypt a secret set
    Check {
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        #[arg(long, value_name = "FILE")]
        env_file: Option<PathBuf>,
    },
}

pub async fn handle_command(command: SecretsCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        SecretsCommand::Check { env, env_file } => {
            let config = CliConfig::load_or_default(config_path)?;
            let secrets = collect_env(&env, env_file.as_deref())?;
            if secrets.is_empty() {
                anyhow::bail!("No variables given; pass --env KEY=VALUE or --env-file");
            }

            let client = daemon_client(&config)?;
            let sealed = seal_for_daemon(&config, &client, &secrets).await?;
            let response = client.check_secrets(&sealed).await?;
            report(&response)?;

            let received: Vec<&str> = response
                .payload
                .as_ref()
                .and_then(|p| p["variables"].as_array())
                .map(|names| names.iter().filter_map(|n| n.as_str()).collect())
                .unwrap_or_default();
            for name in secrets.keys() {
                if received.contains(&name.as_str()) {
                    println!("  {} {}", "✓".green(), name);
                } else {
                    println!("  {} {} (missing)", "✗".red(), name);
                }
            }
            if received.len() != secrets.len() {
                anyhow::bail!("daemon decrypted {} of {} variable(s)", received.len(), secrets.len());
            }
            Ok(())
        }
    }
}

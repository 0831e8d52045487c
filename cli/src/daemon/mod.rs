// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode implementation
//!
//! Handles:
//! - Foreground serving of the signed command API
//! - HTTP health checks against a running daemon
//! - Graceful shutdown

use anyhow::Result;

pub mod client;
pub mod server;

pub use client::DaemonClient;
pub use server::run_daemon;

#[derive(Debug, Clone)]
pub enum DaemonStatus {
    Running { version: String, uptime: u64 },
    Unreachable { error: String },
}

/// Probe `/health` on the daemon at `base_url`. Unsigned, no identity needed.
pub async fn check_daemon_running(base_url: &str) -> Result<DaemonStatus> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()?;

    let url = format!("{}/health", base_url.trim_end_matches('/'));
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            let body: serde_json::Value = response.json().await?;
            Ok(DaemonStatus::Running {
                version: body["version"].as_str().unwrap_or("unknown").to_string(),
                uptime: body["uptime_secs"].as_u64().unwrap_or(0),
            })
        }
        Ok(response) => Ok(DaemonStatus::Unreachable {
            error: format!("health check returned {}", response.status()),
        }),
        Err(e) => Ok(DaemonStatus::Unreachable { error: e.to_string() }),
    }
}

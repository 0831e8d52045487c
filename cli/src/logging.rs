// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. `format` is `text` (compact) or `json`.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder
            .json()
            .with_current_span(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e)),
        "text" => builder
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e)),
        other => anyhow::bail!("Unknown log format '{}', expected 'text' or 'json'", other),
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reverse proxy admin seam (Caddy-style JSON admin API).

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The proxy rejected the candidate config. Nothing was loaded.
    #[error("proxy config failed validation: {0}")]
    ConfigValidation(String),
    #[error("proxy admin request failed: {0}")]
    Http(String),
    #[error("proxy admin returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// Current full config (`Value::Null` when none is loaded).
    async fn get_config(&self) -> Result<Value, ProxyError>;
    /// Check a full config without applying it.
    async fn validate(&self, config: &Value) -> Result<(), ProxyError>;
    /// Replace the running config.
    async fn load(&self, config: &Value) -> Result<(), ProxyError>;
    /// Replace the value at `path` (relative to `/config/`).
    async fn patch(&self, path: &str, value: &Value) -> Result<(), ProxyError>;
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::domain::supervisor::HealthProbe;

/// TCP connect against `host:port` for each published port.
pub struct TcpHealthProbe {
    host: String,
    timeout: Duration,
}

impl TcpHealthProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

impl Default for TcpHealthProbe {
    fn default() -> Self {
        Self::new("127.0.0.1", Duration::from_secs(2))
    }
}

#[async_trait]
impl HealthProbe for TcpHealthProbe {
    async fn probe(&self, ports: &[u16]) -> bool {
        if ports.is_empty() {
            return true;
        }
        for port in ports {
            let addr = format!("{}:{}", self.host, port);
            match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => debug!(%addr, error = %e, "Probe connect failed"),
                Err(_) => debug!(%addr, "Probe timed out"),
            }
        }
        false
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Fleet Domain
//!
//! Named remote servers and the seams the fleet manager is built on.
//!
//! ```text
//! FleetManager ──▶ Connector::connect(ServerConfig) ──▶ RemoteConnection
//!                                                        ├─ exec      (blocking, cancellable)
//!                                                        ├─ upload / download (SFTP)
//!                                                        └─ close
//! ```
//!
//! [`RemoteConnection`] is a blocking interface. Callers run it under
//! `tokio::task::spawn_blocking`; the SSH implementation lives in
//! [`crate::infrastructure::ssh`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One fleet member.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Unique name used to address the server.
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
    /// Fallback when public-key auth is unavailable or rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            key_path: None,
            key_passphrase: None,
            password: None,
        }
    }

    pub fn with_key(mut self, key_path: impl AsRef<Path>) -> Self {
        self.key_path = Some(key_path.as_ref().to_path_buf());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// secrets stay out of logs
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub fn default_ssh_port() -> u16 {
    22
}

/// What to do when a host has no entry in the known-hosts store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Unknown hosts are rejected.
    Strict,
    /// Unknown hosts are recorded on first contact, then pinned.
    #[default]
    AcceptNew,
}

/// Quote `value` as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Read-only view of a pooled session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub connected_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("connection to {server} failed: {reason}")]
    Connection { server: String, reason: String },
    #[error("host key for {server} does not match the known-hosts entry")]
    HostKeyMismatch { server: String },
    #[error("host key for {server} is not in the known-hosts store")]
    UnknownHostKey { server: String },
    #[error("unknown server: {0}")]
    UnknownServer(String),
    #[error("server {0} is not connected")]
    NotConnected(String),
    #[error("command on {server} exited with status {exit_status}")]
    CommandFailed {
        server: String,
        exit_status: i32,
        output: String,
    },
    #[error("command on {server} was cancelled")]
    Cancelled { server: String },
    #[error("file transfer on {server} failed: {reason}")]
    Transfer { server: String, reason: String },
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<(String, FleetError)>),
    #[error("blocking task failed: {0}")]
    Task(String),
}

impl FleetError {
    /// Server names carried by an aggregate error, or the single server otherwise.
    pub fn servers(&self) -> Vec<&str> {
        match self {
            FleetError::Aggregate(failures) => failures.iter().map(|(name, _)| name.as_str()).collect(),
            FleetError::Connection { server, .. }
            | FleetError::HostKeyMismatch { server }
            | FleetError::UnknownHostKey { server }
            | FleetError::CommandFailed { server, .. }
            | FleetError::Cancelled { server }
            | FleetError::Transfer { server, .. } => vec![server.as_str()],
            FleetError::UnknownServer(server) | FleetError::NotConnected(server) => vec![server.as_str()],
            FleetError::Task(_) => Vec::new(),
        }
    }
}

fn format_aggregate(failures: &[(String, FleetError)]) -> String {
    let details: Vec<String> = failures
        .iter()
        .map(|(name, err)| format!("{}: {}", name, err))
        .collect();
    format!("{} server(s) failed: {}", failures.len(), details.join("; "))
}

/// A live, authenticated connection to one server. All methods block.
pub trait RemoteConnection: Send + Sync {
    /// Run `command`, streaming combined stdout/stderr through `output`.
    ///
    /// Returns the remote exit status. When `cancel` fires, the remote process is
    /// signalled and [`FleetError::Cancelled`] is returned.
    fn exec(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        output: &mut dyn FnMut(&[u8]),
        cancel: &CancellationToken,
    ) -> Result<i32, FleetError>;

    /// Copy a local file to `remote`. Returns the number of bytes written.
    fn upload(&self, local: &Path, remote: &str) -> Result<u64, FleetError>;

    fn download(&self, remote: &str, local: &Path) -> Result<u64, FleetError>;

    /// Close SFTP first, then the SSH session.
    fn close(&self) -> Result<(), FleetError>;
}

/// Dials and authenticates one server. Blocking.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn RemoteConnection>, FleetError>;
}

/// Command execution on named servers, the surface remote operations are built on.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        server: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FleetError>;

    /// Like [`RemoteExecutor::execute`], with `input` fed to the command's stdin.
    async fn execute_with_input(
        &self,
        server: &str,
        command: &str,
        input: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, FleetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults_port() {
        let config: ServerConfig =
            serde_yaml::from_str("name: web-1\nhost: 10.0.0.5\nusername: deploy\n").unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.address(), "10.0.0.5:22");
        assert!(config.key_path.is_none());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let mut config = ServerConfig::new("db", "db.internal", "root");
        config.password = Some("hunter2".into());
        config.key_passphrase = Some("phrase".into());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("phrase\""));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_aggregate_names_every_server() {
        let err = FleetError::Aggregate(vec![
            (
                "web-2".into(),
                FleetError::Connection {
                    server: "web-2".into(),
                    reason: "no such key".into(),
                },
            ),
            ("db".into(), FleetError::HostKeyMismatch { server: "db".into() }),
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 server(s) failed"));
        assert!(message.contains("web-2"));
        assert!(message.contains("db"));
        assert_eq!(err.servers(), vec!["web-2", "db"]);
    }
}

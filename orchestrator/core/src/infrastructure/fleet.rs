// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Fleet Connection Manager
//!
//! Name-keyed pool of live sessions to the configured servers.
//!
//! ## Locking
//!
//! ```text
//! sessions: RwLock<name -> Arc<PooledSession>>     shared: list/lookup   exclusive: connect/reconnect/close
//! PooledSession.lock: tokio Mutex<()>               one command or transfer in flight per server
//! ```
//!
//! The pool lock is never held across an `.await`: callers clone the session
//! `Arc` out, release the pool lock, then wait on the session lock. The session
//! lock is held until the blocking libssh2 task has returned, including on
//! cancellation, so a cancelled command never leaves the server locked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::fleet::{
    Connector, FleetError, RemoteConnection, RemoteExecutor, ServerConfig, SessionInfo,
};

struct PooledSession {
    config: ServerConfig,
    connection: Arc<dyn RemoteConnection>,
    lock: tokio::sync::Mutex<()>,
    connected_at: DateTime<Utc>,
    last_used_at: Mutex<DateTime<Utc>>,
}

impl PooledSession {
    fn new(config: ServerConfig, connection: Arc<dyn RemoteConnection>) -> Self {
        let now = Utc::now();
        Self {
            config,
            connection,
            lock: tokio::sync::Mutex::new(()),
            connected_at: now,
            last_used_at: Mutex::new(now),
        }
    }

    fn touch(&self) {
        *self.last_used_at.lock() = Utc::now();
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.config.name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            connected_at: self.connected_at,
            last_used_at: *self.last_used_at.lock(),
        }
    }
}

pub type OutputSink<'a> = Option<&'a mut (dyn AsyncWrite + Send + Unpin)>;

pub struct FleetManager {
    connector: Arc<dyn Connector>,
    configs: RwLock<HashMap<String, ServerConfig>>,
    sessions: RwLock<HashMap<String, Arc<PooledSession>>>,
}

impl FleetManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            configs: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to every server concurrently.
    ///
    /// Servers that connect stay usable even when others fail; the returned
    /// [`FleetError::Aggregate`] names each failure.
    pub async fn connect_all(&self, configs: &[ServerConfig]) -> Result<(), FleetError> {
        {
            let mut known = self.configs.write();
            for config in configs {
                known.insert(config.name.clone(), config.clone());
            }
        }

        let attempts = configs.iter().cloned().map(|config| {
            let connector = self.connector.clone();
            async move {
                let name = config.name.clone();
                let dialed = tokio::task::spawn_blocking(move || {
                    connector.connect(&config).map(|conn| (config, conn))
                })
                .await
                .map_err(|e| FleetError::Task(e.to_string()))
                .and_then(|result| result);
                (name, dialed)
            }
        });

        let mut failures = Vec::new();
        for (name, result) in join_all(attempts).await {
            match result {
                Ok((config, connection)) => self.install(config, connection).await,
                Err(e) => {
                    warn!(server = %name, error = %e, "Failed to connect");
                    failures.push((name, e));
                }
            }
        }

        info!(
            connected = configs.len() - failures.len(),
            failed = failures.len(),
            "Fleet connection pass complete"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Aggregate(failures))
        }
    }

    pub async fn connect(&self, config: &ServerConfig) -> Result<(), FleetError> {
        self.connect_all(std::slice::from_ref(config))
            .await
            .map_err(|e| match e {
                FleetError::Aggregate(mut failures) if failures.len() == 1 => failures.remove(0).1,
                other => other,
            })
    }

    async fn install(&self, config: ServerConfig, connection: Arc<dyn RemoteConnection>) {
        let name = config.name.clone();
        let previous = self
            .sessions
            .write()
            .insert(name.clone(), Arc::new(PooledSession::new(config, connection)));
        if let Some(previous) = previous {
            if let Err(e) = shutdown(previous).await {
                debug!(server = %name, error = %e, "Error closing replaced session");
            }
        }
    }

    fn session(&self, server: &str) -> Result<Arc<PooledSession>, FleetError> {
        if let Some(session) = self.sessions.read().get(server) {
            return Ok(session.clone());
        }
        if self.configs.read().contains_key(server) {
            Err(FleetError::NotConnected(server.to_string()))
        } else {
            Err(FleetError::UnknownServer(server.to_string()))
        }
    }

    /// Run `command` on `server`, teeing combined output into `sink` and the
    /// returned string. A non-zero exit yields [`FleetError::CommandFailed`]
    /// carrying the captured output.
    pub async fn execute(
        &self,
        server: &str,
        command: &str,
        sink: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, FleetError> {
        self.run(server, command, None, sink, cancel).await
    }

    pub async fn execute_streaming_input(
        &self,
        server: &str,
        command: &str,
        input: &[u8],
        sink: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, FleetError> {
        self.run(server, command, Some(input), sink, cancel).await
    }

    async fn run(
        &self,
        server: &str,
        command: &str,
        input: Option<&[u8]>,
        mut sink: OutputSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, FleetError> {
        let session = self.session(server)?;
        let _guard = tokio::select! {
            guard = session.lock.lock() => guard,
            _ = cancel.cancelled() => {
                return Err(FleetError::Cancelled { server: server.to_string() });
            }
        };

        debug!(server = %server, "Executing remote command");
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let connection = session.connection.clone();
        let command = command.to_string();
        let input = input.map(<[u8]>::to_vec);
        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut emit = |chunk: &[u8]| {
                let _ = tx.send(chunk.to_vec());
            };
            connection.exec(&command, input.as_deref(), &mut emit, &token)
        });

        // the channel closes once the blocking task drops its sender
        let mut captured = Vec::new();
        let mut sink_failed = false;
        while let Some(chunk) = rx.recv().await {
            if let Some(writer) = sink.as_deref_mut() {
                if !sink_failed {
                    if let Err(e) = writer.write_all(&chunk).await {
                        warn!(server = %server, error = %e, "Output sink failed, continuing capture only");
                        sink_failed = true;
                    }
                }
            }
            captured.extend_from_slice(&chunk);
        }
        if let Some(writer) = sink.as_deref_mut() {
            let _ = writer.flush().await;
        }

        let status = task.await.map_err(|e| FleetError::Task(e.to_string()))??;
        session.touch();
        let output = String::from_utf8_lossy(&captured).into_owned();
        if status == 0 {
            Ok(output)
        } else {
            Err(FleetError::CommandFailed {
                server: server.to_string(),
                exit_status: status,
                output,
            })
        }
    }

    pub async fn upload_file(&self, server: &str, local: &Path, remote: &str) -> Result<u64, FleetError> {
        let session = self.session(server)?;
        let _guard = session.lock.lock().await;
        let connection = session.connection.clone();
        let local = local.to_path_buf();
        let remote_path = remote.to_string();
        let written = tokio::task::spawn_blocking(move || connection.upload(&local, &remote_path))
            .await
            .map_err(|e| FleetError::Task(e.to_string()))??;
        session.touch();
        info!(server = %server, remote = %remote, bytes = written, "Uploaded file");
        Ok(written)
    }

    pub async fn download_file(&self, server: &str, remote: &str, local: &Path) -> Result<u64, FleetError> {
        let session = self.session(server)?;
        let _guard = session.lock.lock().await;
        let connection = session.connection.clone();
        let local_path: PathBuf = local.to_path_buf();
        let remote_path = remote.to_string();
        let read = tokio::task::spawn_blocking(move || connection.download(&remote_path, &local_path))
            .await
            .map_err(|e| FleetError::Task(e.to_string()))??;
        session.touch();
        info!(server = %server, remote = %remote, bytes = read, "Downloaded file");
        Ok(read)
    }

    /// Close any existing session for `server` and dial it again from its stored
    /// config. Close errors are logged, never returned.
    pub async fn reconnect(&self, server: &str) -> Result<(), FleetError> {
        let config = self
            .configs
            .read()
            .get(server)
            .cloned()
            .ok_or_else(|| FleetError::UnknownServer(server.to_string()))?;
        let previous = self.sessions.write().remove(server);
        if let Some(previous) = previous {
            if let Err(e) = shutdown(previous).await {
                warn!(server = %server, error = %e, "Error closing session before reconnect");
            }
        }
        info!(server = %server, "Reconnecting");
        self.connect(&config).await
    }

    pub async fn disconnect(&self, server: &str) -> Result<(), FleetError> {
        let removed = self.sessions.write().remove(server);
        match removed {
            Some(session) => shutdown(session).await,
            None => Err(FleetError::NotConnected(server.to_string())),
        }
    }

    /// Close every session. The pool is always emptied, even when some closes fail.
    pub async fn close_all(&self) -> Result<(), FleetError> {
        let drained: Vec<(String, Arc<PooledSession>)> = self.sessions.write().drain().collect();
        let mut failures = Vec::new();
        for (name, session) in drained {
            if let Err(e) = shutdown(session).await {
                failures.push((name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Aggregate(failures))
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().values().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    pub fn configured(&self) -> Vec<ServerConfig> {
        let mut configs: Vec<ServerConfig> = self.configs.read().values().cloned().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }
}

/// Wait for in-flight work on the session, then close it off the runtime.
async fn shutdown(session: Arc<PooledSession>) -> Result<(), FleetError> {
    let _guard = session.lock.lock().await;
    let connection = session.connection.clone();
    tokio::task::spawn_blocking(move || connection.close())
        .await
        .map_err(|e| FleetError::Task(e.to_string()))?
}

#[async_trait]
impl RemoteExecutor for FleetManager {
    async fn execute(
        &self,
        server: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FleetError> {
        self.run(server, command, None, None, cancel).await
    }

    async fn execute_with_input(
        &self,
        server: &str,
        command: &str,
        input: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, FleetError> {
        self.run(server, command, Some(input), None, cancel).await
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # SSH Transport (libssh2)
//!
//! [`Ssh2Connector`] dials, pins the host key against an OpenSSH known-hosts
//! file and authenticates. [`SshConnection`] is one authenticated session plus
//! a lazily opened SFTP channel.
//!
//! Everything here blocks; the fleet manager drives it from
//! `spawn_blocking`.
//!
//! ## Remote process control
//!
//! Commands are wrapped so the remote shell reports its pid on the first output
//! line before `exec`ing the real command:
//!
//! ```text
//! printf '%s\n' "$$"; exec sh -c '<command>'
//! ```
//!
//! sshd starts every exec request in a fresh session, so that pid leads its
//! process group and cancellation can signal the whole group.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use parking_lot::Mutex;
use ssh2::{CheckResult, ExtendedData, HashType, KnownHostFileKind, Session, Sftp};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::fleet::{
    shell_quote, Connector, FleetError, HostKeyPolicy, RemoteConnection, ServerConfig,
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const KILL_TIMEOUT_MS: u32 = 5_000;
const KEEPALIVE_SECS: u32 = 30;
const MAX_PID_HEADER: usize = 32;
const PID_WAIT: Duration = Duration::from_secs(3);
const STDIN_CHUNK: usize = 32 * 1024;

pub struct Ssh2Connector {
    known_hosts: PathBuf,
    policy: HostKeyPolicy,
    connect_timeout: Duration,
    // serializes read-modify-write of the known-hosts file across parallel dials
    known_hosts_lock: Mutex<()>,
}

impl Ssh2Connector {
    pub fn new(known_hosts: impl Into<PathBuf>, policy: HostKeyPolicy) -> Self {
        Self {
            known_hosts: known_hosts.into(),
            policy,
            connect_timeout: Duration::from_secs(15),
            known_hosts_lock: Mutex::new(()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn verify_host_key(&self, session: &Session, config: &ServerConfig) -> Result<(), FleetError> {
        let conn_err = |reason: String| FleetError::Connection {
            server: config.name.clone(),
            reason,
        };
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| conn_err("server presented no host key".into()))?;
        let fingerprint = session
            .host_key_hash(HashType::Sha256)
            .map(|hash| format!("SHA256:{}", STANDARD_NO_PAD.encode(hash)))
            .unwrap_or_else(|| "unknown".to_string());

        let _guard = self.known_hosts_lock.lock();
        let mut known = session
            .known_hosts()
            .map_err(|e| conn_err(format!("known-hosts init: {}", e)))?;
        if self.known_hosts.exists() {
            known
                .read_file(&self.known_hosts, KnownHostFileKind::OpenSSH)
                .map_err(|e| conn_err(format!("reading {}: {}", self.known_hosts.display(), e)))?;
        }

        match known.check_port(&config.host, config.port, key) {
            CheckResult::Match => {
                debug!(server = %config.name, %fingerprint, "Host key matches known-hosts entry");
                Ok(())
            }
            CheckResult::Mismatch => {
                warn!(server = %config.name, %fingerprint, "Host key mismatch");
                Err(FleetError::HostKeyMismatch {
                    server: config.name.clone(),
                })
            }
            CheckResult::NotFound if self.policy == HostKeyPolicy::Strict => {
                Err(FleetError::UnknownHostKey {
                    server: config.name.clone(),
                })
            }
            CheckResult::NotFound => {
                let entry = known_hosts_entry(&config.host, config.port);
                known
                    .add(&entry, key, &config.name, key_type.into())
                    .map_err(|e| conn_err(format!("recording host key: {}", e)))?;
                if let Some(parent) = self.known_hosts.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| conn_err(format!("creating {}: {}", parent.display(), e)))?;
                }
                known
                    .write_file(&self.known_hosts, KnownHostFileKind::OpenSSH)
                    .map_err(|e| conn_err(format!("writing {}: {}", self.known_hosts.display(), e)))?;
                info!(server = %config.name, host = %entry, %fingerprint, "Recorded new host key");
                Ok(())
            }
            CheckResult::Failure => Err(conn_err("known-hosts check failed".into())),
        }
    }
}

fn authenticate(session: &Session, config: &ServerConfig) -> Result<(), FleetError> {
    if let Some(key_path) = &config.key_path {
        if let Err(e) = session.userauth_pubkey_file(
            &config.username,
            None,
            key_path,
            config.key_passphrase.as_deref(),
        ) {
            debug!(server = %config.name, error = %e, "Public key authentication failed");
        }
    }
    if !session.authenticated() {
        if let Some(password) = &config.password {
            if let Err(e) = session.userauth_password(&config.username, password) {
                debug!(server = %config.name, error = %e, "Password authentication failed");
            }
        }
    }
    if session.authenticated() {
        Ok(())
    } else {
        Err(FleetError::Connection {
            server: config.name.clone(),
            reason: format!("authentication failed for user {}", config.username),
        })
    }
}

fn dial(config: &ServerConfig, timeout: Duration) -> Result<TcpStream, FleetError> {
    let conn_err = |reason: String| FleetError::Connection {
        server: config.name.clone(),
        reason,
    };
    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| conn_err(format!("resolving {}: {}", config.address(), e)))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(conn_err(match last_error {
        Some(e) => format!("dialing {}: {}", config.address(), e),
        None => format!("{} resolved to no addresses", config.address()),
    }))
}

impl Connector for Ssh2Connector {
    fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn RemoteConnection>, FleetError> {
        let conn_err = |reason: String| FleetError::Connection {
            server: config.name.clone(),
            reason,
        };
        if let Some(key_path) = &config.key_path {
            if !key_path.is_file() {
                return Err(conn_err(format!("private key {} not found", key_path.display())));
            }
        }

        let tcp = dial(config, self.connect_timeout)?;
        let mut session = Session::new().map_err(|e| conn_err(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| conn_err(format!("handshake: {}", e)))?;
        self.verify_host_key(&session, config)?;
        authenticate(&session, config)?;
        session.set_timeout(0);
        session.set_keepalive(true, KEEPALIVE_SECS);

        info!(server = %config.name, address = %config.address(), "SSH session established");
        Ok(Arc::new(SshConnection::new(config.name.clone(), session)))
    }
}

/// Host field of a known-hosts line; non-default ports use `[host]:port`.
pub fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// One authenticated SSH session.
pub struct SshConnection {
    server: String,
    session: Mutex<Option<Session>>,
    sftp: Mutex<Option<Sftp>>,
}

impl SshConnection {
    fn new(server: String, session: Session) -> Self {
        Self {
            server,
            session: Mutex::new(Some(session)),
            sftp: Mutex::new(None),
        }
    }

    fn exec_err(&self, reason: impl std::fmt::Display) -> FleetError {
        FleetError::Connection {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }

    fn transfer_err(&self, reason: impl std::fmt::Display) -> FleetError {
        FleetError::Transfer {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }

    fn with_sftp<T>(&self, f: impl FnOnce(&Sftp) -> Result<T, FleetError>) -> Result<T, FleetError> {
        let session = self.session.lock();
        let session = session
            .as_ref()
            .ok_or_else(|| FleetError::NotConnected(self.server.clone()))?;
        let mut slot = self.sftp.lock();
        let sftp = match slot.take() {
            Some(sftp) => sftp,
            None => session.sftp().map_err(|e| self.transfer_err(format!("sftp: {}", e)))?,
        };
        let result = f(&sftp);
        *slot = Some(sftp);
        result
    }

    fn kill_remote(&self, session: &Session, pid: u32) {
        session.set_blocking(true);
        session.set_timeout(KILL_TIMEOUT_MS);
        let killed = session.channel_session().and_then(|mut channel| {
            channel.exec(&format!("kill -TERM -- -{pid} 2>/dev/null || kill -TERM {pid}"))?;
            channel.wait_close()
        });
        session.set_timeout(0);
        match killed {
            Ok(()) => info!(server = %self.server, pid, "Signalled cancelled remote command"),
            Err(e) => warn!(server = %self.server, pid, error = %e, "Failed to signal remote command"),
        }
    }
}

impl RemoteConnection for SshConnection {
    fn exec(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        output: &mut dyn FnMut(&[u8]),
        cancel: &CancellationToken,
    ) -> Result<i32, FleetError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| FleetError::NotConnected(self.server.clone()))?;

        session.set_blocking(true);
        let mut channel = session.channel_session().map_err(|e| self.exec_err(e))?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(|e| self.exec_err(e))?;
        channel.exec(&wrap_with_pid(command)).map_err(|e| self.exec_err(e))?;

        // stdin is pumped from the same non-blocking loop as output, so a
        // command that never drains its input cannot hold off cancellation
        session.set_blocking(false);
        let mut pending = stdin.unwrap_or_default();
        let mut eof_sent = false;
        let mut header = PidHeader::default();
        let mut buf = [0u8; 8192];
        let streamed = loop {
            if cancel.is_cancelled() {
                let pid = match header.pid() {
                    Some(pid) => Some(pid),
                    None => await_pid(&mut header, |b| channel.read(b), Instant::now() + PID_WAIT),
                };
                match pid {
                    Some(pid) => self.kill_remote(session, pid),
                    None => warn!(
                        server = %self.server,
                        "Remote pid never arrived; closing channel without signalling"
                    ),
                }
                break Err(FleetError::Cancelled {
                    server: self.server.clone(),
                });
            }

            let mut progressed = false;
            if !eof_sent {
                if pending.is_empty() {
                    match channel.send_eof().map_err(std::io::Error::from) {
                        Ok(()) => {
                            eof_sent = true;
                            progressed = true;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => break Err(self.exec_err(format!("closing input: {}", e))),
                    }
                } else {
                    match channel.write(&pending[..pending.len().min(STDIN_CHUNK)]) {
                        Ok(n) => {
                            pending = &pending[n..];
                            progressed = n > 0;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => break Err(self.exec_err(format!("writing input: {}", e))),
                    }
                }
            }

            match channel.read(&mut buf) {
                Ok(0) if channel.eof() => break Ok(()),
                Ok(0) => {}
                Ok(n) => {
                    progressed = true;
                    let body = header.feed(&buf[..n]);
                    if !body.is_empty() {
                        output(&body);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if channel.eof() {
                        break Ok(());
                    }
                }
                Err(e) => break Err(self.exec_err(format!("reading output: {}", e))),
            }
            if !progressed {
                std::thread::sleep(POLL_INTERVAL);
            }
        };
        session.set_blocking(true);

        if let Err(e) = streamed {
            let _ = channel.close();
            return Err(e);
        }
        let rest = header.finish();
        if !rest.is_empty() {
            output(&rest);
        }
        channel.wait_close().map_err(|e| self.exec_err(e))?;
        channel.exit_status().map_err(|e| self.exec_err(e))
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<u64, FleetError> {
        let mut source = std::fs::File::open(local)
            .map_err(|e| self.transfer_err(format!("{}: {}", local.display(), e)))?;
        self.with_sftp(|sftp| {
            let mut target = sftp
                .create(Path::new(remote))
                .map_err(|e| self.transfer_err(format!("{}: {}", remote, e)))?;
            std::io::copy(&mut source, &mut target).map_err(|e| self.transfer_err(e))
        })
    }

    fn download(&self, remote: &str, local: &Path) -> Result<u64, FleetError> {
        let mut target = std::fs::File::create(local)
            .map_err(|e| self.transfer_err(format!("{}: {}", local.display(), e)))?;
        self.with_sftp(|sftp| {
            let mut source = sftp
                .open(Path::new(remote))
                .map_err(|e| self.transfer_err(format!("{}: {}", remote, e)))?;
            std::io::copy(&mut source, &mut target).map_err(|e| self.transfer_err(e))
        })
    }

    fn close(&self) -> Result<(), FleetError> {
        drop(self.sftp.lock().take());
        match self.session.lock().take() {
            Some(session) => session
                .disconnect(None, "closing", None)
                .map_err(|e| self.exec_err(format!("disconnect: {}", e))),
            None => Ok(()),
        }
    }
}

fn wrap_with_pid(command: &str) -> String {
    format!("printf '%s\\n' \"$$\"; exec sh -c {}", shell_quote(command))
}

/// Keeps reading after cancellation until the pid line arrives, the stream
/// ends or `deadline` passes. Output read here is dropped.
fn await_pid(
    header: &mut PidHeader,
    mut read: impl FnMut(&mut [u8]) -> std::io::Result<usize>,
    deadline: Instant,
) -> Option<u32> {
    let mut buf = [0u8; 512];
    while header.pid().is_none() && !header.done && Instant::now() < deadline {
        match read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                header.feed(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }
    header.pid()
}

/// Strips the pid line emitted by [`wrap_with_pid`] from the output stream.
#[derive(Default)]
struct PidHeader {
    buffered: Vec<u8>,
    pid: Option<u32>,
    done: bool,
}

impl PidHeader {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the part of `chunk` that belongs to the command's own output.
    fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.done {
            return chunk.to_vec();
        }
        self.buffered.extend_from_slice(chunk);
        match self.buffered.iter().position(|b| *b == b'\n') {
            Some(idx) => {
                self.done = true;
                let line = String::from_utf8_lossy(&self.buffered[..idx]).trim().to_string();
                match line.parse::<u32>() {
                    Ok(pid) => {
                        self.pid = Some(pid);
                        self.buffered.split_off(idx + 1)
                    }
                    Err(_) => std::mem::take(&mut self.buffered),
                }
            }
            None if self.buffered.len() > MAX_PID_HEADER => {
                self.done = true;
                std::mem::take(&mut self.buffered)
            }
            None => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        self.done = true;
        std::mem::take(&mut self.buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hosts_entry_brackets_custom_ports() {
        assert_eq!(known_hosts_entry("10.0.0.1", 22), "10.0.0.1");
        assert_eq!(known_hosts_entry("example.com", 2222), "[example.com]:2222");
    }

    #[test]
    fn test_wrap_with_pid_quotes_command() {
        assert_eq!(
            wrap_with_pid("echo 'hi'"),
            "printf '%s\\n' \"$$\"; exec sh -c 'echo '\\''hi'\\'''"
        );
    }

    #[test]
    fn test_pid_header_split_across_chunks() {
        let mut header = PidHeader::default();
        assert!(header.feed(b"42").is_empty());
        assert_eq!(header.feed(b"17\nhello"), b"hello");
        assert_eq!(header.pid(), Some(4217));
        assert_eq!(header.feed(b" world"), b" world");
    }

    #[test]
    fn test_pid_header_passes_through_unexpected_output() {
        let mut header = PidHeader::default();
        assert_eq!(header.feed(b"sh: printf: not found\nrest"), b"sh: printf: not found\nrest");
        assert_eq!(header.pid(), None);

        let mut short = PidHeader::default();
        assert!(short.feed(b"99").is_empty());
        assert_eq!(short.finish(), b"99");
    }

    fn scripted(mut chunks: Vec<std::io::Result<Vec<u8>>>) -> impl FnMut(&mut [u8]) -> std::io::Result<usize> {
        chunks.reverse();
        move |buf| match chunks.pop() {
            Some(Ok(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Some(Err(e)) => Err(e),
            None => Err(std::io::ErrorKind::WouldBlock.into()),
        }
    }

    #[test]
    fn test_cancel_before_pid_waits_for_header() {
        let mut header = PidHeader::default();
        let read = scripted(vec![
            Err(std::io::ErrorKind::WouldBlock.into()),
            Ok(b"43".to_vec()),
            Err(std::io::ErrorKind::WouldBlock.into()),
            Ok(b"21\npartial output".to_vec()),
        ]);
        let pid = await_pid(&mut header, read, Instant::now() + Duration::from_secs(5));
        assert_eq!(pid, Some(4321));
    }

    #[test]
    fn test_cancel_gives_up_when_pid_never_arrives() {
        let mut header = PidHeader::default();
        let started = Instant::now();
        let pid = await_pid(&mut header, scripted(Vec::new()), started + Duration::from_millis(100));
        assert_eq!(pid, None);
        assert!(started.elapsed() >= Duration::from_millis(100));

        let mut closed = PidHeader::default();
        assert_eq!(await_pid(&mut closed, scripted(vec![Ok(Vec::new())]), Instant::now() + PID_WAIT), None);

        let mut garbled = PidHeader::default();
        garbled.feed(b"not a pid\n");
        assert_eq!(await_pid(&mut garbled, scripted(Vec::new()), Instant::now() + PID_WAIT), None);
    }

    #[test]
    fn test_missing_key_file_fails_before_dialing() {
        let tmp = tempfile::tempdir().unwrap();
        let connector = Ssh2Connector::new(tmp.path().join("known_hosts"), HostKeyPolicy::Strict);
        let config = ServerConfig::new("web-3", "192.0.2.10", "deploy")
            .with_key(tmp.path().join("missing_ed25519"));
        match connector.connect(&config) {
            Err(FleetError::Connection { server, reason }) => {
                assert_eq!(server, "web-3");
                assert!(reason.contains("not found"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connection should fail"),
        }
    }
}

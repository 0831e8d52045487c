// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Remote Operations
//!
//! Provisioning procedures built only on [`RemoteExecutor`].
//!
//! ## Server preparation
//!
//! ```text
//! probe docker + caddy ──both verified──▶ done (no changes)
//!        │
//!        ▼
//! id -u ─▶ sudo prefix ─▶ detect package manager (fixed priority)
//!        ─▶ base tools ─▶ docker ─▶ verify ─▶ caddy ─▶ verify
//! ```
//!
//! Each step is skipped when its tool already verifies, so re-running after a
//! partial failure only does the remaining work.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::domain::fleet::{shell_quote, FleetError, RemoteExecutor};

#[derive(Debug, Error)]
pub enum RemoteOpsError {
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error("{server}: no supported package manager found (tried {tried})")]
    UnsupportedPlatform { server: String, tried: String },
    #[error("{server}: {tool} verification failed: {detail}")]
    Verification {
        server: String,
        tool: String,
        detail: String,
    },
    #[error("invalid credential path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Apk,
    Pacman,
    Zypper,
}

impl PackageManager {
    /// Probe order.
    pub const PRIORITY: [PackageManager; 6] = [
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Apk,
        PackageManager::Pacman,
        PackageManager::Zypper,
    ];

    pub fn binary(self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Apk => "apk",
            Self::Pacman => "pacman",
            Self::Zypper => "zypper",
        }
    }

    pub fn install(self, packages: &[&str]) -> String {
        let list = packages.join(" ");
        match self {
            Self::Apt => format!(
                "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {}",
                list
            ),
            Self::Dnf => format!("dnf install -y -q {}", list),
            Self::Yum => format!("yum install -y -q {}", list),
            Self::Apk => format!("apk add --no-cache {}", list),
            Self::Pacman => format!("pacman -Sy --noconfirm --needed {}", list),
            Self::Zypper => format!("zypper --non-interactive install {}", list),
        }
    }

    fn base_tools(self) -> &'static [&'static str] {
        match self {
            Self::Apt => &["ca-certificates", "curl", "git", "build-essential"],
            Self::Dnf | Self::Yum => &["ca-certificates", "curl", "git", "gcc", "make"],
            Self::Apk => &["ca-certificates", "curl", "git", "build-base"],
            Self::Pacman => &["ca-certificates", "curl", "git", "base-devel"],
            Self::Zypper => &["ca-certificates", "curl", "git", "gcc", "make"],
        }
    }

    fn docker_install(self) -> String {
        let install = match self {
            // upstream convenience script covers the Debian and RHEL families
            Self::Apt | Self::Dnf | Self::Yum => "curl -fsSL https://get.docker.com | sh".to_string(),
            Self::Apk => self.install(&["docker"]),
            Self::Pacman => self.install(&["docker"]),
            Self::Zypper => self.install(&["docker"]),
        };
        let enable = match self {
            Self::Apk => "rc-update add docker default && rc-service docker start",
            _ => "systemctl enable --now docker",
        };
        format!("{} && {}", install, enable)
    }

    fn caddy_install(self) -> String {
        match self {
            Self::Apt => [
                "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq debian-keyring debian-archive-keyring apt-transport-https gnupg",
                "curl -1sLf https://dl.cloudsmith.io/public/caddy/stable/gpg.key | gpg --batch --yes --dearmor -o /usr/share/keyrings/caddy-stable-archive-keyring.gpg",
                "curl -1sLf https://dl.cloudsmith.io/public/caddy/stable/debian.deb.txt > /etc/apt/sources.list.d/caddy-stable.list",
                "apt-get update -qq",
                "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq caddy",
            ]
            .join(" && "),
            Self::Dnf => "dnf install -y -q 'dnf-command(copr)' && dnf copr enable -y @caddy/caddy && dnf install -y -q caddy".to_string(),
            Self::Yum => "yum install -y -q yum-plugin-copr && yum copr enable -y @caddy/caddy && yum install -y -q caddy".to_string(),
            Self::Apk | Self::Pacman | Self::Zypper => self.install(&["caddy"]),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Docker,
    Caddy,
}

impl Tool {
    fn name(self) -> &'static str {
        match self {
            Tool::Docker => "docker",
            Tool::Caddy => "caddy",
        }
    }

    fn version_command(self) -> &'static str {
        match self {
            Tool::Docker => "docker --version",
            Tool::Caddy => "caddy version",
        }
    }

    /// Extract a version from the version command's output, if it looks right.
    fn parse_version(self, output: &str) -> Option<String> {
        let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
        match self {
            Tool::Docker if line.starts_with("Docker version ") => Some(line["Docker version ".len()..].to_string()),
            Tool::Caddy if line.starts_with('v') => line.split_whitespace().next().map(str::to_string),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub server: String,
    /// Nothing needed installing.
    pub already_prepared: bool,
    pub package_manager: Option<PackageManager>,
    pub installed: Vec<String>,
    pub docker_version: String,
    pub caddy_version: String,
}

/// Credential material destined for a single remote file.
pub struct StagedCredentials {
    /// Relative paths resolve against the login user's home directory.
    pub remote_path: String,
    pub contents: Zeroizing<Vec<u8>>,
    pub use_sudo: bool,
}

impl StagedCredentials {
    pub fn new(remote_path: impl Into<String>, contents: Vec<u8>) -> Self {
        Self {
            remote_path: remote_path.into(),
            contents: Zeroizing::new(contents),
            use_sudo: false,
        }
    }

    /// A Docker `config.json` holding one registry login.
    pub fn docker_registry(registry: &str, username: &str, password: &str) -> Self {
        let auth = Zeroizing::new(STANDARD.encode(format!("{}:{}", username, password)));
        let config = serde_json::json!({ "auths": { registry: { "auth": auth.as_str() } } });
        Self::new(".docker/config.json", config.to_string().into_bytes())
    }
}

impl fmt::Debug for StagedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedCredentials")
            .field("remote_path", &self.remote_path)
            .field("contents", &format_args!("<{} bytes>", self.contents.len()))
            .field("use_sudo", &self.use_sudo)
            .finish()
    }
}

pub struct RemoteOperations<'a> {
    executor: &'a dyn RemoteExecutor,
}

impl<'a> RemoteOperations<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor) -> Self {
        Self { executor }
    }

    async fn probe(&self, server: &str, tool: Tool, cancel: &CancellationToken) -> Result<Option<String>, FleetError> {
        match self.executor.execute(server, tool.version_command(), cancel).await {
            Ok(output) => Ok(tool.parse_version(&output)),
            Err(FleetError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn verify(&self, server: &str, tool: Tool, cancel: &CancellationToken) -> Result<String, RemoteOpsError> {
        match self.executor.execute(server, tool.version_command(), cancel).await {
            Ok(output) => tool.parse_version(&output).ok_or_else(|| RemoteOpsError::Verification {
                server: server.to_string(),
                tool: tool.name().to_string(),
                detail: format!("unexpected output: {}", output.trim()),
            }),
            Err(FleetError::CommandFailed { exit_status, output, .. }) => Err(RemoteOpsError::Verification {
                server: server.to_string(),
                tool: tool.name().to_string(),
                detail: format!("exit status {}: {}", exit_status, output.trim()),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn sudo_prefix(&self, server: &str, cancel: &CancellationToken) -> Result<bool, FleetError> {
        let uid = self.executor.execute(server, "id -u", cancel).await?;
        Ok(uid.trim() != "0")
    }

    pub async fn detect_package_manager(
        &self,
        server: &str,
        cancel: &CancellationToken,
    ) -> Result<PackageManager, RemoteOpsError> {
        for pm in PackageManager::PRIORITY {
            let probe = format!("command -v {}", pm.binary());
            match self.executor.execute(server, &probe, cancel).await {
                Ok(_) => return Ok(pm),
                Err(FleetError::CommandFailed { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(RemoteOpsError::UnsupportedPlatform {
            server: server.to_string(),
            tried: PackageManager::PRIORITY
                .iter()
                .map(|pm| pm.binary())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    async fn privileged(&self, server: &str, sudo: bool, command: &str, cancel: &CancellationToken) -> Result<String, FleetError> {
        let command = if sudo {
            format!("sudo -n sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        };
        self.executor.execute(server, &command, cancel).await
    }

    /// Install the container engine and reverse proxy if missing. Idempotent.
    pub async fn prepare_server(&self, server: &str, cancel: &CancellationToken) -> Result<PrepareReport, RemoteOpsError> {
        let docker = self.probe(server, Tool::Docker, cancel).await?;
        let caddy = self.probe(server, Tool::Caddy, cancel).await?;
        if let (Some(docker_version), Some(caddy_version)) = (&docker, &caddy) {
            info!(server = %server, "Server already prepared");
            return Ok(PrepareReport {
                server: server.to_string(),
                already_prepared: true,
                package_manager: None,
                installed: Vec::new(),
                docker_version: docker_version.clone(),
                caddy_version: caddy_version.clone(),
            });
        }

        let sudo = self.sudo_prefix(server, cancel).await?;
        let pm = self.detect_package_manager(server, cancel).await?;
        info!(server = %server, package_manager = %pm, sudo, "Preparing server");

        let mut installed = Vec::new();
        self.privileged(server, sudo, &pm.install(pm.base_tools()), cancel).await?;
        installed.push("base-tools".to_string());

        let docker_version = match docker {
            Some(version) => version,
            None => {
                self.privileged(server, sudo, &pm.docker_install(), cancel).await?;
                installed.push(Tool::Docker.name().to_string());
                self.verify(server, Tool::Docker, cancel).await?
            }
        };
        let caddy_version = match caddy {
            Some(version) => version,
            None => {
                self.privileged(server, sudo, &pm.caddy_install(), cancel).await?;
                installed.push(Tool::Caddy.name().to_string());
                self.verify(server, Tool::Caddy, cancel).await?
            }
        };

        info!(server = %server, docker = %docker_version, caddy = %caddy_version, "Server prepared");
        Ok(PrepareReport {
            server: server.to_string(),
            already_prepared: false,
            package_manager: Some(pm),
            installed,
            docker_version,
            caddy_version,
        })
    }

    /// Write credentials with one remote command: private temp file, then rename.
    ///
    /// The contents travel on stdin, never on the command line.
    pub async fn stage_credentials(
        &self,
        server: &str,
        creds: &StagedCredentials,
        cancel: &CancellationToken,
    ) -> Result<(), RemoteOpsError> {
        let command = staging_command(&creds.remote_path)?;
        let command = if creds.use_sudo {
            format!("sudo -n sh -c {}", shell_quote(&command))
        } else {
            command
        };
        match self
            .executor
            .execute_with_input(server, &command, &creds.contents, cancel)
            .await
        {
            Ok(_) => {
                info!(server = %server, path = %creds.remote_path, "Staged credentials");
                Ok(())
            }
            Err(e) => {
                warn!(server = %server, path = %creds.remote_path, "Credential staging failed");
                Err(e.into())
            }
        }
    }
}

fn staging_command(remote_path: &str) -> Result<String, RemoteOpsError> {
    let path = remote_path.trim();
    if path.is_empty() || path.ends_with('/') || path.contains('\0') || path.contains('\n') {
        return Err(RemoteOpsError::InvalidPath(remote_path.to_string()));
    }
    let dir = match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    };
    let target = shell_quote(path);
    Ok(format!(
        "umask 077 && mkdir -p {dir} && tmp=$(mktemp {tmpl}) && cat > \"$tmp\" && chmod 600 \"$tmp\" && mv -f \"$tmp\" {target}",
        dir = shell_quote(&dir),
        tmpl = shell_quote(&format!("{}.XXXXXX", path)),
        target = target,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Replies by command prefix; unmatched commands succeed with empty output.
    #[derive(Default)]
    struct ScriptedExecutor {
        replies: Mutex<HashMap<String, Vec<Result<String, i32>>>>,
        log: Mutex<Vec<(String, Option<Vec<u8>>)>>,
    }

    impl ScriptedExecutor {
        fn reply(&self, command: &str, result: Result<&str, i32>) {
            self.replies
                .lock()
                .entry(command.to_string())
                .or_default()
                .push(result.map(str::to_string));
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().iter().map(|(c, _)| c.clone()).collect()
        }

        fn respond(&self, server: &str, command: &str, input: Option<&[u8]>) -> Result<String, FleetError> {
            self.log.lock().push((command.to_string(), input.map(<[u8]>::to_vec)));
            let mut replies = self.replies.lock();
            let key = replies.keys().find(|k| command.starts_with(k.as_str())).cloned();
            let reply = key.and_then(|k| {
                let queue = replies.get_mut(&k)?;
                if queue.len() > 1 {
                    Some(queue.remove(0))
                } else {
                    queue.first().cloned()
                }
            });
            match reply.unwrap_or(Ok(String::new())) {
                Ok(output) => Ok(output),
                Err(code) => Err(FleetError::CommandFailed {
                    server: server.to_string(),
                    exit_status: code,
                    output: String::new(),
                }),
            }
        }
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn execute(&self, server: &str, command: &str, _cancel: &CancellationToken) -> Result<String, FleetError> {
            self.respond(server, command, None)
        }

        async fn execute_with_input(
            &self,
            server: &str,
            command: &str,
            input: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<String, FleetError> {
            self.respond(server, command, Some(input))
        }
    }

    #[tokio::test]
    async fn test_prepared_server_short_circuits() {
        let exec = ScriptedExecutor::default();
        exec.reply("docker --version", Ok("Docker version 27.3.1, build ce12230\n"));
        exec.reply("caddy version", Ok("v2.8.4 h1:q3pe0wpBj1OcHFZ3n/1nl4V4bxBrYoSoab7rL9BMYNk=\n"));

        let report = RemoteOperations::new(&exec)
            .prepare_server("web", &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.already_prepared);
        assert_eq!(report.docker_version, "27.3.1, build ce12230");
        assert_eq!(report.caddy_version, "v2.8.4");
        assert_eq!(exec.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_server_installs_in_order_with_sudo() {
        let exec = ScriptedExecutor::default();
        exec.reply("docker --version", Err(127));
        exec.reply("docker --version", Ok("Docker version 27.3.1, build ce12230"));
        exec.reply("caddy version", Err(127));
        exec.reply("caddy version", Ok("v2.8.4"));
        exec.reply("id -u", Ok("1000\n"));
        exec.reply("command -v apt-get", Err(1));
        exec.reply("command -v dnf", Ok("/usr/bin/dnf"));

        let report = RemoteOperations::new(&exec)
            .prepare_server("web", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.already_prepared);
        assert_eq!(report.package_manager, Some(PackageManager::Dnf));
        assert_eq!(report.installed, vec!["base-tools", "docker", "caddy"]);

        let commands = exec.commands();
        let installs: Vec<&String> = commands.iter().filter(|c| c.starts_with("sudo -n sh -c")).collect();
        assert_eq!(installs.len(), 3);
        assert!(installs[0].contains("dnf install -y -q ca-certificates"));
        assert!(installs[1].contains("get.docker.com"));
        assert!(installs[2].contains("@caddy/caddy"));
        assert!(!commands.iter().any(|c| c.contains("command -v yum")));
    }

    #[tokio::test]
    async fn test_bad_version_output_fails_verification() {
        let exec = ScriptedExecutor::default();
        exec.reply("docker --version", Err(127));
        exec.reply("docker --version", Ok("command not found"));
        exec.reply("caddy version", Ok("v2.8.4"));
        exec.reply("id -u", Ok("0"));

        let err = RemoteOperations::new(&exec)
            .prepare_server("web", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteOpsError::Verification { ref tool, .. } if tool == "docker"));
        assert!(!exec.commands().iter().any(|c| c.starts_with("sudo")));
    }

    #[tokio::test]
    async fn test_no_package_manager() {
        let exec = ScriptedExecutor::default();
        exec.reply("docker --version", Err(127));
        exec.reply("caddy version", Err(127));
        exec.reply("id -u", Ok("0"));
        exec.reply("command -v", Err(1));

        let err = RemoteOperations::new(&exec)
            .prepare_server("nas", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteOpsError::UnsupportedPlatform { .. }));
        assert!(err.to_string().contains("zypper"));
    }

    #[tokio::test]
    async fn test_stage_credentials_single_command_over_stdin() {
        let exec = ScriptedExecutor::default();
        let creds = StagedCredentials::docker_registry("ghcr.io", "bot", "tok3n");
        RemoteOperations::new(&exec)
            .stage_credentials("web", &creds, &CancellationToken::new())
            .await
            .unwrap();

        let log = exec.log.lock();
        assert_eq!(log.len(), 1);
        let (command, input) = &log[0];
        assert!(command.starts_with("umask 077 && mkdir -p '.docker'"));
        assert!(command.contains("mv -f \"$tmp\" '.docker/config.json'"));
        assert!(!command.contains("tok3n"));

        let written: serde_json::Value = serde_json::from_slice(input.as_ref().unwrap()).unwrap();
        assert_eq!(written["auths"]["ghcr.io"]["auth"], STANDARD.encode("bot:tok3n"));
    }

    #[test]
    fn test_staging_command_paths() {
        assert!(staging_command("/etc/shipyard/").is_err());
        assert!(staging_command("").is_err());
        assert!(staging_command("/root.env").unwrap().contains("mkdir -p '/'"));
        assert!(staging_command("creds").unwrap().contains("mkdir -p '.'"));
        assert!(format!("{:?}", StagedCredentials::new("x", b"secret".to_vec())).contains("<6 bytes>"));
    }
}

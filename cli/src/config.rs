// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// CLI Configuration
//
// Operator-side settings: where the daemon lives, which daemon key secrets are
// sealed to, the CLI signing identity, SSH trust settings and the fleet.
//
// Discovery order:
// 1. --config flag
// 2. SHIPYARD_CLI_CONFIG environment variable
// 3. ./shipyard.yaml
// 4. ~/.shipyard/config.yaml

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shipyard_core::domain::fleet::{HostKeyPolicy, ServerConfig};
use shipyard_core::domain::keys::KeyId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Base URL of the daemon HTTP API
    #[serde(default = "default_daemon_url")]
    pub daemon_url: String,

    /// Daemon key id that secrets are sealed to (from `shipyard keys show`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_key_id: Option<String>,

    /// Hex X25519 public key matching `daemon_key_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_ecdh_public: Option<String>,

    /// Ed25519 signing identity of this CLI
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,

    /// Name the daemon knows this identity by (defaults to the local hostname)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_name: Option<String>,

    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

fn shipyard_home() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shipyard")
}

fn default_daemon_url() -> String {
    "http://127.0.0.1:7878".to_string()
}

fn default_identity_path() -> PathBuf {
    shipyard_home().join("identity.json")
}

fn default_known_hosts_path() -> PathBuf {
    shipyard_home().join("known_hosts")
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            daemon_url: default_daemon_url(),
            daemon_key_id: None,
            daemon_ecdh_public: None,
            identity_path: default_identity_path(),
            identity_name: None,
            known_hosts_path: default_known_hosts_path(),
            host_key_policy: HostKeyPolicy::default(),
            servers: Vec::new(),
        }
    }
}

impl CliConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SHIPYARD_CLI_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./shipyard.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        let home = shipyard_home().join("config.yaml");
        if home.exists() {
            return Some(home);
        }

        None
    }

    /// Load configuration with discovery, fallback to default.
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self> {
        let config = if let Some(path) = cli_path {
            tracing::debug!("Loading CLI configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)
                .with_context(|| format!("Failed to load config at {:?}", path))?
        } else if let Some(path) = Self::discover_config() {
            tracing::debug!("Loading CLI configuration from discovered path: {:?}", path);
            Self::from_yaml_file(&path)
                .with_context(|| format!("Failed to load config at {:?}", path))?
        } else {
            tracing::debug!("No CLI configuration found, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.daemon_url.starts_with("http://") || self.daemon_url.starts_with("https://")) {
            anyhow::bail!("daemon_url must be an http(s) URL: {}", self.daemon_url);
        }

        match (&self.daemon_key_id, &self.daemon_ecdh_public) {
            (None, None) => {}
            (Some(_), Some(_)) => {
                self.daemon_key()?;
            }
            _ => anyhow::bail!("daemon_key_id and daemon_ecdh_public must be set together"),
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                anyhow::bail!("server name cannot be empty");
            }
            if !names.insert(server.name.as_str()) {
                anyhow::bail!("duplicate server name: {}", server.name);
            }
            if server.host.is_empty() {
                anyhow::bail!("server {} has no host", server.name);
            }
            if server.username.is_empty() {
                anyhow::bail!("server {} has no username", server.name);
            }
            if server.port == 0 {
                anyhow::bail!("server {} has port 0", server.name);
            }
        }

        Ok(())
    }

    /// The pinned daemon key, when one is configured.
    pub fn daemon_key(&self) -> Result<Option<(KeyId, [u8; 32])>> {
        let (Some(key_id), Some(public)) = (&self.daemon_key_id, &self.daemon_ecdh_public) else {
            return Ok(None);
        };
        let key_id = KeyId::parse(key_id)
            .with_context(|| format!("daemon_key_id is not a valid key id: {}", key_id))?;
        Ok(Some((key_id, decode_public_key(public).context("daemon_ecdh_public")?)))
    }

    pub fn server(&self, name: &str) -> Result<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .with_context(|| format!("Server '{}' is not in the configuration", name))
    }

    pub fn identity_name(&self) -> String {
        self.identity_name
            .clone()
            .unwrap_or_else(|| hostname_or("shipyard-cli"))
    }
}

/// Decode a hex encoded 32-byte public key.
pub fn decode_public_key(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim()).context("public key is not valid hex")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("public key must be 32 bytes, got {}", b.len()))
}

fn hostname_or(fallback: &str) -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_defaults() {
        let config = CliConfig::default();
        assert_eq!(config.daemon_url, "http://127.0.0.1:7878");
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptNew);
        assert!(config.identity_path.ends_with(".shipyard/identity.json"));
        assert!(config.daemon_key().unwrap().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fleet_yaml_fills_port_default() {
        let yaml = format!(
            r#"
daemon_url: https://deploy.example.com
daemon_key_id: {KEY_ID}
daemon_ecdh_public: {}
host_key_policy: strict
servers:
  - name: web-1
    host: 10.0.0.1
    username: deploy
    key_path: /home/ops/.ssh/id_ed25519
  - name: db
    host: 10.0.0.2
    port: 2222
    username: root
    password: hunter2
"#,
            "11".repeat(32)
        );
        let config = CliConfig::from_yaml_str(&yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.server("web-1").unwrap().port, 22);
        assert_eq!(config.server("db").unwrap().port, 2222);
        assert!(config.server("cache").is_err());

        let (key_id, public) = config.daemon_key().unwrap().unwrap();
        assert_eq!(key_id.as_str(), KEY_ID);
        assert_eq!(public, [0x11; 32]);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = CliConfig {
            daemon_url: "127.0.0.1:7878".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.daemon_url = default_daemon_url();

        config.daemon_key_id = Some(KEY_ID.into());
        assert!(config.validate().is_err());
        config.daemon_ecdh_public = Some("abcd".into());
        assert!(config.validate().is_err());
        config.daemon_ecdh_public = Some("22".repeat(32));
        assert!(config.validate().is_ok());

        config.servers = vec![
            ServerConfig::new("web", "10.0.0.1", "deploy"),
            ServerConfig::new("web", "10.0.0.2", "deploy"),
        ];
        assert!(config.validate().is_err());
        config.servers[1].name = "web-2".into();
        config.servers[1].username.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(CliConfig::load_or_default(Some(tmp.path().join("missing.yaml"))).is_err());
    }
}

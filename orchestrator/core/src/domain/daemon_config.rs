// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Daemon Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) for the shipyard
// daemon, covering:
// - HTTP listener
// - Key store location and rotation
// - Supervisor cadence, restart caps and backoff
// - Docker connection
// - Reverse proxy admin endpoint
// - Logging

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "DaemonConfig";

/// Top-level daemon configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfigManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub metadata: DaemonMetadata,

    #[serde(default)]
    pub spec: DaemonConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonMetadata {
    /// Human-readable daemon name, shown by `/health`
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfigSpec {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub keys: KeysConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Directory holding daemon-keys.json and trusted-peers.json (kept at 0700)
    #[serde(default = "default_key_dir")]
    pub directory: PathBuf,

    /// How long a rotated-out key still decrypts in-flight messages
    #[serde(default = "default_rotation_grace")]
    pub rotation_grace_secs: u64,

    /// Rotate automatically at this interval (disabled when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisor_interval")]
    pub interval_secs: u64,

    /// Applied to deployed apps that do not set their own cap (-1 = unlimited)
    #[serde(default = "default_max_restarts")]
    pub default_max_restarts: i32,

    /// First restart delay; doubles per consecutive restart (0 disables backoff)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Timeout of the TCP reachability probe per port
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Grace period given to a container on stop before it is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker socket path (auto-detected when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Caddy admin endpoint, e.g. http://127.0.0.1:2019 (routes are not managed when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,

    /// Name of the Caddy HTTP server that receives app routes
    #[serde(default = "default_proxy_server")]
    pub server_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("/var/lib/shipyard/keys")
}

fn default_rotation_grace() -> u64 {
    24 * 60 * 60
}

fn default_supervisor_interval() -> u64 {
    30
}

fn default_max_restarts() -> i32 {
    5
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_max() -> u64 {
    300
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_stop_grace() -> u64 {
    10
}

fn default_proxy_server() -> String {
    "shipyard".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            directory: default_key_dir(),
            rotation_grace_secs: default_rotation_grace(),
            rotation_interval_secs: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_supervisor_interval(),
            default_max_restarts: default_max_restarts(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            probe_timeout_ms: default_probe_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: None,
            server_name: default_proxy_server(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for DaemonConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "shipyard-daemon".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: DaemonMetadata {
                name: hostname,
                version: None,
            },
            spec: DaemonConfigSpec::default(),
        }
    }
}

impl DaemonConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. SHIPYARD_CONFIG_PATH environment variable
    /// 2. ./shipyard-daemon.yaml (working directory)
    /// 3. /etc/shipyard/daemon.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SHIPYARD_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./shipyard-daemon.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        let system_config = PathBuf::from("/etc/shipyard/daemon.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides so container deployments can
    /// reconfigure without a file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SHIPYARD_BIND_ADDRESS") {
            tracing::info!("Environment override: SHIPYARD_BIND_ADDRESS={}", val);
            self.spec.network.bind_address = val;
        }

        if let Ok(val) = std::env::var("SHIPYARD_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: SHIPYARD_PORT={}", port);
                    self.spec.network.port = port;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for SHIPYARD_PORT: '{}'. Ignoring.", val);
                }
            }
        }

        if let Ok(val) = std::env::var("SHIPYARD_KEY_DIR") {
            tracing::info!("Environment override: SHIPYARD_KEY_DIR={}", val);
            self.spec.keys.directory = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SHIPYARD_DOCKER_SOCKET") {
            tracing::info!("Environment override: SHIPYARD_DOCKER_SOCKET={}", val);
            self.spec.runtime.docker_socket = Some(val);
        }

        if let Ok(val) = std::env::var("SHIPYARD_LOG_LEVEL") {
            self.spec.logging.level = val;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.network.port == 0 {
            anyhow::bail!("spec.network.port cannot be 0");
        }

        if self.spec.keys.directory.as_os_str().is_empty() {
            anyhow::bail!("spec.keys.directory cannot be empty");
        }

        if let Some(interval) = self.spec.keys.rotation_interval_secs {
            if interval <= self.spec.keys.rotation_grace_secs {
                anyhow::bail!(
                    "spec.keys.rotation_interval_secs ({}) must exceed rotation_grace_secs ({})",
                    interval,
                    self.spec.keys.rotation_grace_secs
                );
            }
        }

        let supervisor = &self.spec.supervisor;
        if supervisor.interval_secs == 0 {
            anyhow::bail!("spec.supervisor.interval_secs must be at least 1");
        }
        if supervisor.default_max_restarts < -1 {
            anyhow::bail!("spec.supervisor.default_max_restarts must be -1 (unlimited) or >= 0");
        }
        if supervisor.backoff_max_secs < supervisor.backoff_base_secs {
            anyhow::bail!("spec.supervisor.backoff_max_secs must be >= backoff_base_secs");
        }

        if let Some(url) = &self.spec.proxy.admin_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("spec.proxy.admin_url must be an http(s) URL: {}", url);
            }
        }

        match self.spec.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("spec.logging.format must be 'text' or 'json', got '{}'", other),
        }

        Ok(())
    }
}

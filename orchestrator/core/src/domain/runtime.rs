// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Container engine seam.
//!
//! The supervisor and dispatcher only see [`ContainerEngine`]; the Docker
//! implementation is [`crate::infrastructure::runtime::DockerEngine`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Label set on every container this daemon creates. Startup recovery lists by it.
pub const MANAGED_LABEL: &str = "shipyard.managed";
/// Label carrying the app name a container belongs to.
pub const APP_LABEL: &str = "shipyard.app";

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container engine unreachable: {0}")]
    Connection(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container engine error: {0}")]
    Engine(String),
}

/// `host:container` TCP port publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| format!("invalid port '{}' in '{}'", part, value))
        };
        match value.split_once(':') {
            Some((host, container)) => Ok(Self {
                host: parse(host)?,
                container: parse(container)?,
            }),
            None => {
                let port = parse(value)?;
                Ok(Self {
                    host: port,
                    container: port,
                })
            }
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// Everything needed to create one managed container.
#[derive(Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// May hold decrypted secrets; never logged, wiped on drop.
    pub env: BTreeMap<String, Zeroizing<String>>,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let name = name.into();
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (APP_LABEL.to_string(), name.clone()),
        ]);
        Self {
            name,
            image: image.into(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            labels,
        }
    }
}

impl fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("ports", &self.ports)
            .field("labels", &self.labels)
            .finish()
    }
}

/// Engine state collapsed to what the supervisor reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Running,
    Restarting,
    Stopped,
    Failed,
}

impl ObservedState {
    /// Map a Docker-style status string and exit code.
    pub fn from_engine(status: &str, exit_code: Option<i64>) -> Self {
        match status {
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "dead" => Self::Failed,
            "exited" if exit_code.unwrap_or(0) != 0 => Self::Failed,
            _ => Self::Stopped,
        }
    }
}

/// The engine's native health check result, when the image defines one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    None,
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInspection {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ObservedState,
    pub exit_code: Option<i64>,
    pub health: HealthStatus,
    /// Host ports bound for this container.
    pub published_ports: Vec<u16>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<(), ContainerError>;
    /// Pull `image` unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError>;
    /// Returns the new container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;
    async fn start(&self, name: &str) -> Result<(), ContainerError>;
    async fn stop(&self, name: &str, grace: Duration) -> Result<(), ContainerError>;
    async fn remove(&self, name: &str, force: bool) -> Result<(), ContainerError>;
    async fn inspect(&self, name: &str) -> Result<ContainerInspection, ContainerError>;
    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, ContainerError>;
    /// `label` is either `key` or `key=value`.
    async fn list_by_label(&self, label: &str) -> Result<Vec<ContainerSummary>, ContainerError>;
}

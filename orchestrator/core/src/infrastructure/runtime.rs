// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum, HostConfig, PortBinding,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use crate::domain::runtime::{
    ContainerEngine, ContainerError, ContainerInspection, ContainerSpec, ContainerSummary,
    HealthStatus, ObservedState,
};

const API_TIMEOUT_SECS: u64 = 120;

/// [`ContainerEngine`] backed by the local Docker API.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Use `runtime.docker_socket` when set, the platform default otherwise.
    /// No request is made here; readiness is checked with `ping`.
    pub fn new(socket: Option<&str>) -> Result<Self, ContainerError> {
        let connected = match socket {
            Some(path) => connect_socket(path.strip_prefix("unix://").unwrap_or(path)),
            None => Docker::connect_with_local_defaults(),
        };
        let docker = connected.map_err(|e| connect_failure(socket, &e))?;
        debug!(socket = socket.unwrap_or("default"), "Docker client configured");
        Ok(Self { docker })
    }
}

#[cfg(unix)]
fn connect_socket(path: &str) -> Result<Docker, BollardError> {
    Docker::connect_with_unix(path, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
}

#[cfg(windows)]
fn connect_socket(path: &str) -> Result<Docker, BollardError> {
    Docker::connect_with_named_pipe(path, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
}

fn connect_failure(socket: Option<&str>, err: &BollardError) -> ContainerError {
    let target = match socket {
        Some(path) => format!("{} (runtime.docker_socket)", path),
        None => "the default socket (set runtime.docker_socket or SHIPYARD_DOCKER_SOCKET)".to_string(),
    };
    ContainerError::Connection(format!(
        "cannot reach Docker at {}: {}; `shipyard daemon config` prints the effective settings",
        target, err
    ))
}

fn engine_error(name: &str, err: BollardError) -> ContainerError {
    match err {
        BollardError::DockerResponseServerError { status_code: 404, .. } => {
            ContainerError::NotFound(name.to_string())
        }
        BollardError::DockerResponseServerError { status_code, message } => {
            ContainerError::Engine(format!("{} ({}): {}", name, status_code, message))
        }
        other => ContainerError::Connection(other.to_string()),
    }
}

/// 304 from start/stop means the container is already in the requested state.
fn not_modified(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 304, .. })
}

fn to_inspection(name: &str, inspect: ContainerInspectResponse) -> ContainerInspection {
    let state = inspect.state.unwrap_or_default();
    let exit_code = state.exit_code;
    let status = match state.status {
        Some(ContainerStateStatusEnum::RUNNING) => "running",
        Some(ContainerStateStatusEnum::RESTARTING) => "restarting",
        Some(ContainerStateStatusEnum::EXITED) => "exited",
        Some(ContainerStateStatusEnum::DEAD) => "dead",
        Some(ContainerStateStatusEnum::CREATED) => "created",
        Some(ContainerStateStatusEnum::PAUSED) => "paused",
        _ => "unknown",
    };
    let health = match state.health.and_then(|h| h.status) {
        Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
        Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
        _ => HealthStatus::None,
    };

    let mut published_ports: Vec<u16> = inspect
        .network_settings
        .and_then(|n| n.ports)
        .unwrap_or_default()
        .into_values()
        .flatten()
        .flatten()
        .filter_map(|binding| binding.host_port.and_then(|p| p.parse().ok()))
        .collect();
    published_ports.sort_unstable();
    published_ports.dedup();

    let config = inspect.config.unwrap_or_default();
    ContainerInspection {
        id: inspect.id.unwrap_or_default(),
        name: inspect
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name.to_string()),
        image: config.image.unwrap_or_default(),
        state: ObservedState::from_engine(status, exit_code),
        exit_code,
        health,
        published_ports,
        labels: config.labels.unwrap_or_default(),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), ContainerError> {
        self.docker.ping().await.map_err(|e| {
            ContainerError::Connection(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image present locally");
            return Ok(());
        }

        info!("Pulling image: {}", image);
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(ContainerError::Engine(format!(
                    "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                    image, e, image
                )));
            }
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.as_str()))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for mapping in &spec.ports {
            let key = format!("{}/tcp", mapping.container);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(mapping.host.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let res = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| engine_error(&spec.name, e))?;
        info!(container = %spec.name, id = %res.id, "Created container");
        Ok(res.id)
    }

    async fn start(&self, name: &str) -> Result<(), ContainerError> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!(container = %name, "Started container");
                Ok(())
            }
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(engine_error(name, e)),
        }
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), ContainerError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => {
                info!(container = %name, "Stopped container");
                Ok(())
            }
            Err(e) if not_modified(&e) => Ok(()),
            Err(e) => Err(engine_error(name, e)),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), ContainerError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| engine_error(name, e))?;
        info!(container = %name, "Removed container");
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInspection, ContainerError> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| engine_error(name, e))?;
        Ok(to_inspection(name, inspect))
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, ContainerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| engine_error(name, e))?;
            let text = String::from_utf8_lossy(&chunk.into_bytes()).into_owned();
            lines.extend(text.lines().map(str::to_string));
        }
        Ok(lines)
    }

    async fn list_by_label(&self, label: &str) -> Result<Vec<ContainerSummary>, ContainerError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| engine_error(label, e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, ContainerState, Health, NetworkSettings};

    #[test]
    fn test_connect_failure_names_the_socket_setting() {
        let err = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "refused".into(),
        };
        let configured = connect_failure(Some("/run/user/1000/docker.sock"), &err).to_string();
        assert!(configured.contains("/run/user/1000/docker.sock (runtime.docker_socket)"));
        assert!(configured.contains("shipyard daemon config"));

        let default = connect_failure(None, &err).to_string();
        assert!(default.contains("SHIPYARD_DOCKER_SOCKET"));
        assert!(default.contains("refused"));
    }

    #[test]
    fn test_inspection_maps_state_health_and_ports() {
        let inspect = ContainerInspectResponse {
            id: Some("abc123".into()),
            name: Some("/api".into()),
            config: Some(ContainerConfig {
                image: Some("ghcr.io/acme/api:1".into()),
                ..Default::default()
            }),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                exit_code: Some(0),
                health: Some(Health {
                    status: Some(HealthStatusEnum::UNHEALTHY),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ports: Some(HashMap::from([
                    (
                        "80/tcp".to_string(),
                        Some(vec![
                            PortBinding {
                                host_ip: Some("0.0.0.0".into()),
                                host_port: Some("8080".into()),
                            },
                            PortBinding {
                                host_ip: Some("::".into()),
                                host_port: Some("8080".into()),
                            },
                        ]),
                    ),
                    ("9000/tcp".to_string(), None),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let view = to_inspection("api", inspect);
        assert_eq!(view.name, "api");
        assert_eq!(view.state, ObservedState::Running);
        assert_eq!(view.health, HealthStatus::Unhealthy);
        assert_eq!(view.published_ports, vec![8080]);
    }

    #[test]
    fn test_missing_state_is_stopped() {
        let view = to_inspection("ghost", ContainerInspectResponse::default());
        assert_eq!(view.state, ObservedState::Stopped);
        assert_eq!(view.name, "ghost");
        assert_eq!(view.health, HealthStatus::None);
    }

    #[test]
    fn test_exited_with_error_is_failed() {
        let inspect = ContainerInspectResponse {
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::EXITED),
                exit_code: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(to_inspection("job", inspect).state, ObservedState::Failed);
    }
}

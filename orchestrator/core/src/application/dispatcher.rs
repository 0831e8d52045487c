// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Command Dispatcher
//!
//! Single entry point for control messages arriving at the daemon.
//!
//! ```text
//! Envelope ─▶ verify signature (named sender, or every trusted peer)
//!          ─▶ parse payload ─▶ open secrets (key id lookup + AEAD)
//!          ─▶ route by command type ─▶ engine / supervisor intents / proxy
//!          ─▶ Response { success, message, payload? }
//! ```
//!
//! Nothing past the signature check runs for an unauthenticated envelope, and
//! every signature, key or decryption failure produces the same message.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::application::proxy_configurator::ProxyConfigurator;
use crate::application::supervisor::{SupervisorError, SupervisorHandle};
use crate::domain::envelope::{Command, EncryptedEnv, Envelope, RequestBody, Response};
use crate::domain::keys::{KeyId, TrustStore};
use crate::domain::proxy::ProxyError;
use crate::domain::runtime::{ContainerEngine, ContainerError, ContainerSpec, PortMapping, MANAGED_LABEL};
use crate::domain::supervisor::{MonitoredApp, RestartPolicy};
use crate::infrastructure::crypto::{self, SecretEnv};

const AUTH_FAILED: &str = "authentication failed";
const DEFAULT_LOG_TAIL: usize = 100;
const MAX_LOG_TAIL: usize = 10_000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{}", AUTH_FAILED)]
    Authentication,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("supervisor: {0}")]
    Supervisor(String),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl From<SupervisorError> for DispatchError {
    fn from(e: SupervisorError) -> Self {
        DispatchError::Supervisor(e.to_string())
    }
}

/// Defaults applied to deployed apps.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub default_max_restarts: i32,
    pub stop_grace: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_max_restarts: 5,
            stop_grace: Duration::from_secs(10),
        }
    }
}

pub struct CommandDispatcher {
    trust_store: Arc<dyn TrustStore>,
    engine: Arc<dyn ContainerEngine>,
    supervisor: SupervisorHandle,
    proxy: Option<Arc<ProxyConfigurator>>,
    settings: DispatchSettings,
}

impl CommandDispatcher {
    pub fn new(
        trust_store: Arc<dyn TrustStore>,
        engine: Arc<dyn ContainerEngine>,
        supervisor: SupervisorHandle,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            trust_store,
            engine,
            supervisor,
            proxy: None,
            settings,
        }
    }

    pub fn with_proxy(mut self, proxy: Arc<ProxyConfigurator>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Handle one envelope. Never fails; errors become `success: false`.
    pub async fn dispatch(&self, envelope: &Envelope) -> Response {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("dispatch", %request_id);
        async {
            match self.handle(envelope).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Request rejected");
                    Response::failure(e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Response, DispatchError> {
        let peer = self.authenticate(envelope)?;
        let body: RequestBody =
            serde_json::from_slice(&envelope.payload).map_err(|e| DispatchError::Malformed(e.to_string()))?;

        match body {
            RequestBody::Secrets(encrypted) => {
                let env = self.open(&encrypted)?;
                let names: Vec<&String> = env.keys().collect();
                info!(peer = %peer, variables = names.len(), "Secret delivery verified");
                Ok(Response::ok_with(
                    format!("received {} variable(s)", names.len()),
                    json!({ "key_id": encrypted.key_id, "variables": names }),
                ))
            }
            RequestBody::Command(command) => {
                info!(peer = %peer, command = %command.kind, "Dispatching command");
                self.route(command).await
            }
        }
    }

    /// Returns the name of the peer whose key verified the envelope.
    fn authenticate(&self, envelope: &Envelope) -> Result<String, DispatchError> {
        let verified = match &envelope.sender {
            Some(name) => self
                .trust_store
                .peer(name)
                .ok()
                .filter(|peer| crypto::verify_envelope(envelope, &peer.signing_public).is_ok()),
            None => self
                .trust_store
                .peers()
                .into_iter()
                .find(|peer| crypto::verify_envelope(envelope, &peer.signing_public).is_ok()),
        };
        match verified {
            Some(peer) => Ok(peer.name),
            None => {
                warn!(sender = envelope.sender.as_deref().unwrap_or("-"), "Envelope signature rejected");
                Err(DispatchError::Authentication)
            }
        }
    }

    fn open(&self, encrypted: &EncryptedEnv) -> Result<SecretEnv, DispatchError> {
        let key_id = KeyId::parse(&encrypted.key_id).ok_or(DispatchError::Authentication)?;
        let pair = self.trust_store.lookup(&key_id).map_err(|e| {
            warn!(key_id = %key_id.short(), error = %e, "Secrets addressed to an unusable key");
            DispatchError::Authentication
        })?;
        crypto::open_env(encrypted, pair.ecdh_private.expose()).map_err(|_| {
            warn!(key_id = %key_id.short(), "Secret decryption failed");
            DispatchError::Authentication
        })
    }

    async fn route(&self, command: Command) -> Result<Response, DispatchError> {
        match command.kind.as_str() {
            "deploy" => self.deploy(&command).await,
            "start" => self.start(&command).await,
            "stop" => self.stop(&command).await,
            "restart" => self.restart(&command).await,
            "status" => self.status(&command).await,
            "logs" => self.logs(&command).await,
            "list" => self.list().await,
            other => Err(DispatchError::UnknownCommand(other.to_string())),
        }
    }

    async fn deploy(&self, command: &Command) -> Result<Response, DispatchError> {
        let name = app_name(command)?;
        let image = command
            .str_arg("image")
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| DispatchError::InvalidArgument("image is required".into()))?;
        let ports = port_args(command)?;
        let restart_policy = match command.str_arg("restart_policy") {
            Some(raw) => raw.parse::<RestartPolicy>().map_err(DispatchError::InvalidArgument)?,
            None => RestartPolicy::default(),
        };
        let max_restarts = match command.args.get("max_restarts") {
            None | Some(Value::Null) => self.settings.default_max_restarts,
            Some(v) => v
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .filter(|n| *n >= -1)
                .ok_or_else(|| DispatchError::InvalidArgument("max_restarts must be an integer >= -1".into()))?,
        };
        let route = self.route_args(command, &ports)?;

        let env = match command.args.get("env") {
            None | Some(Value::Null) => SecretEnv::new(),
            Some(raw) => {
                let encrypted: EncryptedEnv = serde_json::from_value(raw.clone())
                    .map_err(|e| DispatchError::Malformed(format!("env: {}", e)))?;
                self.open(&encrypted)?
            }
        };

        let mut spec = ContainerSpec::new(name, image);
        spec.env = env;
        spec.ports = ports;

        self.engine.ensure_image(image).await?;
        match self.engine.remove(name, true).await {
            Ok(()) => info!(app = %name, "Replaced previous container"),
            Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let id = self.engine.create(&spec).await?;
        self.engine.start(name).await?;
        self.supervisor
            .register(MonitoredApp::new(name, restart_policy, max_restarts))
            .await?;

        if let (Some((domain, upstream)), Some(proxy)) = (&route, &self.proxy) {
            proxy.upsert_route(name, domain, *upstream).await?;
        }

        info!(app = %name, image = %image, variables = spec.env.len(), "Deployed app");
        Ok(Response::ok_with(
            format!("deployed {}", name),
            json!({
                "name": name,
                "id": id,
                "image": image,
                "ports": spec.ports.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "restart_policy": restart_policy,
                "max_restarts": max_restarts,
                "domain": route.as_ref().map(|(d, _)| d),
            }),
        ))
    }

    /// `(domain, upstream host port)` when a domain is requested.
    fn route_args(&self, command: &Command, ports: &[PortMapping]) -> Result<Option<(String, u16)>, DispatchError> {
        let Some(domain) = command.str_arg("domain").filter(|d| !d.is_empty()) else {
            return Ok(None);
        };
        if self.proxy.is_none() {
            return Err(DispatchError::InvalidArgument(
                "domain requested but no proxy admin endpoint is configured".into(),
            ));
        }
        let upstream = match command.args.get("upstream_port") {
            Some(v) => v
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p != 0)
                .ok_or_else(|| DispatchError::InvalidArgument("upstream_port must be a port number".into()))?,
            None => ports
                .first()
                .map(|p| p.host)
                .ok_or_else(|| DispatchError::InvalidArgument("domain requires a published port".into()))?,
        };
        Ok(Some((domain.to_string(), upstream)))
    }

    async fn start(&self, command: &Command) -> Result<Response, DispatchError> {
        let name = app_name(command)?;
        self.engine.start(name).await?;
        let registered = self.supervisor.snapshot(Some(name)).await?;
        match registered.into_iter().next() {
            Some(_) => self.supervisor.reset_restarts(name).await?,
            None => {
                self.supervisor
                    .register(MonitoredApp::new(
                        name,
                        RestartPolicy::default(),
                        self.settings.default_max_restarts,
                    ))
                    .await?
            }
        }
        Ok(Response::ok(format!("started {}", name)))
    }

    async fn stop(&self, command: &Command) -> Result<Response, DispatchError> {
        let name = app_name(command)?;
        // unregister first so the supervisor cannot race the stop with a restart
        self.supervisor.unregister(name).await?;
        self.engine.stop(name, self.settings.stop_grace).await?;
        Ok(Response::ok(format!("stopped {}", name)))
    }

    async fn restart(&self, command: &Command) -> Result<Response, DispatchError> {
        let name = app_name(command)?;
        match self.supervisor.reset_restarts(name).await {
            Ok(()) => {}
            Err(SupervisorError::UnknownApp(_)) => {
                self.supervisor
                    .register(MonitoredApp::new(
                        name,
                        RestartPolicy::default(),
                        self.settings.default_max_restarts,
                    ))
                    .await?
            }
            Err(e) => return Err(e.into()),
        }
        match self.engine.stop(name, self.settings.stop_grace).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.engine.start(name).await?;
        Ok(Response::ok(format!("restarted {}", name)))
    }

    async fn status(&self, command: &Command) -> Result<Response, DispatchError> {
        let name = command.str_arg("name");
        let apps = self.supervisor.snapshot(name).await?;
        if let (Some(name), true) = (name, apps.is_empty()) {
            return Err(DispatchError::InvalidArgument(format!("app {} is not supervised", name)));
        }
        let payload = serde_json::to_value(&apps).map_err(|e| DispatchError::Supervisor(e.to_string()))?;
        Ok(Response::ok_with(format!("{} app(s)", apps.len()), payload))
    }

    async fn logs(&self, command: &Command) -> Result<Response, DispatchError> {
        let name = app_name(command)?;
        let tail = match command.args.get("tail") {
            None => DEFAULT_LOG_TAIL,
            Some(v) => v
                .as_u64()
                .map(|n| (n as usize).min(MAX_LOG_TAIL))
                .ok_or_else(|| DispatchError::InvalidArgument("tail must be a positive integer".into()))?,
        };
        let lines = self.engine.logs(name, tail).await?;
        Ok(Response::ok_with(
            format!("{} line(s)", lines.len()),
            json!({ "name": name, "lines": lines }),
        ))
    }

    async fn list(&self) -> Result<Response, DispatchError> {
        let containers = self.engine.list_by_label(&format!("{}=true", MANAGED_LABEL)).await?;
        let payload =
            serde_json::to_value(&containers).map_err(|e| DispatchError::Supervisor(e.to_string()))?;
        Ok(Response::ok_with(format!("{} container(s)", containers.len()), payload))
    }
}

fn app_name(command: &Command) -> Result<&str, DispatchError> {
    let name = command
        .str_arg("name")
        .ok_or_else(|| DispatchError::InvalidArgument("name is required".into()))?;
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && name.len() <= 128;
    if !valid {
        return Err(DispatchError::InvalidArgument(format!("invalid app name '{}'", name)));
    }
    Ok(name)
}

fn port_args(command: &Command) -> Result<Vec<PortMapping>, DispatchError> {
    match command.args.get("ports") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| DispatchError::InvalidArgument("ports must be strings".into()))?
                    .parse::<PortMapping>()
                    .map_err(DispatchError::InvalidArgument)
            })
            .collect(),
        Some(_) => Err(DispatchError::InvalidArgument("ports must be a list".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::application::supervisor::ContainerSupervisor;
    use crate::domain::daemon_config::SupervisorConfig;
    use crate::domain::keys::{KeyError, KeyPair, PeerIdentity};
    use crate::domain::runtime::{ContainerInspection, ContainerSummary, HealthStatus, ObservedState};
    use crate::domain::supervisor::{AppStatus, HealthProbe};
    use crate::infrastructure::crypto::{seal_env, sign_envelope, signing_public};
    use crate::infrastructure::key_store::generate_key_pair;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    struct MemoryTrust {
        active: Arc<KeyPair>,
        peers: Vec<PeerIdentity>,
    }

    impl TrustStore for MemoryTrust {
        fn active(&self) -> Arc<KeyPair> {
            Arc::clone(&self.active)
        }
        fn lookup(&self, key_id: &KeyId) -> Result<Arc<KeyPair>, KeyError> {
            if *key_id == self.active.key_id {
                Ok(Arc::clone(&self.active))
            } else {
                Err(KeyError::NotFound(key_id.clone()))
            }
        }
        fn peer(&self, name: &str) -> Result<PeerIdentity, KeyError> {
            self.peers
                .iter()
                .find(|p| p.name == name)
                .cloned()
                .ok_or_else(|| KeyError::UnknownPeer(name.to_string()))
        }
        fn peers(&self) -> Vec<PeerIdentity> {
            self.peers.clone()
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<String>>,
        created: Mutex<Vec<ContainerSpec>>,
    }

    #[async_trait]
    impl ContainerEngine for RecordingEngine {
        async fn ping(&self) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
            self.calls.lock().push(format!("pull:{}", image));
            Ok(())
        }
        async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
            self.calls.lock().push(format!("create:{}", spec.name));
            self.created.lock().push(spec.clone());
            Ok(format!("id-{}", spec.name))
        }
        async fn start(&self, name: &str) -> Result<(), ContainerError> {
            self.calls.lock().push(format!("start:{}", name));
            Ok(())
        }
        async fn stop(&self, name: &str, _grace: Duration) -> Result<(), ContainerError> {
            self.calls.lock().push(format!("stop:{}", name));
            Ok(())
        }
        async fn remove(&self, name: &str, _force: bool) -> Result<(), ContainerError> {
            self.calls.lock().push(format!("remove:{}", name));
            Err(ContainerError::NotFound(name.to_string()))
        }
        async fn inspect(&self, name: &str) -> Result<ContainerInspection, ContainerError> {
            Ok(ContainerInspection {
                id: name.to_string(),
                name: name.to_string(),
                image: "img".into(),
                state: ObservedState::Running,
                exit_code: None,
                health: HealthStatus::Healthy,
                published_ports: Vec::new(),
                labels: HashMap::new(),
            })
        }
        async fn logs(&self, _name: &str, tail: usize) -> Result<Vec<String>, ContainerError> {
            Ok((0..tail.min(3)).map(|i| format!("line {}", i)).collect())
        }
        async fn list_by_label(&self, _label: &str) -> Result<Vec<ContainerSummary>, ContainerError> {
            Ok(Vec::new())
        }
    }

    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _ports: &[u16]) -> bool {
            true
        }
    }

    struct Harness {
        dispatcher: CommandDispatcher,
        engine: Arc<RecordingEngine>,
        supervisor: SupervisorHandle,
        daemon: Arc<KeyPair>,
        operator_key: [u8; 32],
    }

    fn harness() -> Harness {
        let daemon = Arc::new(generate_key_pair().unwrap());
        let operator_key = crypto::random_bytes::<32>().unwrap();
        let trust = Arc::new(MemoryTrust {
            active: Arc::clone(&daemon),
            peers: vec![PeerIdentity {
                name: "ops".into(),
                signing_public: signing_public(&operator_key),
                added_at: Utc::now(),
            }],
        });
        let engine = Arc::new(RecordingEngine::default());
        let (supervisor, _task) = ContainerSupervisor::spawn(
            engine.clone(),
            Arc::new(AlwaysUp),
            SupervisorConfig::default(),
            CancellationToken::new(),
        );
        let dispatcher = CommandDispatcher::new(trust, engine.clone(), supervisor.clone(), DispatchSettings::default());
        Harness {
            dispatcher,
            engine,
            supervisor,
            daemon,
            operator_key,
        }
    }

    fn signed(h: &Harness, body: &impl serde::Serialize, sender: Option<&str>) -> Envelope {
        sign_envelope(
            serde_json::to_vec(body).unwrap(),
            sender.map(str::to_string),
            &h.operator_key,
        )
    }

    fn sealed(h: &Harness, secrets: &[(&str, &str)]) -> EncryptedEnv {
        let secrets: BTreeMap<String, String> =
            secrets.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        seal_env(&secrets, &h.daemon.key_id, &h.daemon.ecdh_public).unwrap()
    }

    #[tokio::test]
    async fn test_deploy_decrypts_env_and_registers_app() {
        let h = harness();
        let env = sealed(&h, &[("DB_PASS", "s3cret")]);
        let command = Command::new("deploy")
            .with_arg("name", "api")
            .with_arg("image", "ghcr.io/acme/api:1")
            .with_arg("ports", json!(["8080:80"]))
            .with_arg("max_restarts", 2)
            .with_arg("env", serde_json::to_value(&env).unwrap());

        let response = h.dispatcher.dispatch(&signed(&h, &command, Some("ops"))).await;
        assert!(response.success, "{}", response.message);
        assert!(!response.message.contains("s3cret"));
        assert!(!response.payload.as_ref().unwrap().to_string().contains("s3cret"));

        let created = h.engine.created.lock();
        assert_eq!(created[0].env.get("DB_PASS").map(|v| v.as_str()), Some("s3cret"));
        assert_eq!(created[0].ports[0].host, 8080);
        assert_eq!(
            *h.engine.calls.lock(),
            vec!["pull:ghcr.io/acme/api:1", "remove:api", "create:api", "start:api"]
        );

        let apps = h.supervisor.snapshot(Some("api")).await.unwrap();
        assert_eq!(apps[0].max_restarts, 2);
    }

    #[tokio::test]
    async fn test_bad_signature_has_no_side_effects() {
        let h = harness();
        let command = Command::new("stop").with_arg("name", "api");
        let mut envelope = signed(&h, &command, Some("ops"));
        envelope.signature[0] ^= 0x01;

        let response = h.dispatcher.dispatch(&envelope).await;
        assert!(!response.success);
        assert_eq!(response.message, AUTH_FAILED);
        assert!(h.engine.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sender_and_unnamed_sender() {
        let h = harness();
        let command = Command::new("list");

        let response = h.dispatcher.dispatch(&signed(&h, &command, Some("mallory"))).await;
        assert_eq!(response.message, AUTH_FAILED);

        let response = h.dispatcher.dispatch(&signed(&h, &command, None)).await;
        assert!(response.success, "{}", response.message);
    }

    #[tokio::test]
    async fn test_decrypt_failures_look_like_auth_failures() {
        let h = harness();
        let mut env = sealed(&h, &[("TOKEN", "abc")]);
        env.env_blob[0] ^= 0xff;
        let response = h.dispatcher.dispatch(&signed(&h, &env, Some("ops"))).await;
        assert_eq!(response.message, AUTH_FAILED);

        let mut env = sealed(&h, &[("TOKEN", "abc")]);
        env.key_id = KeyId::from_bytes(&[9u8; 32]).to_string();
        let response = h.dispatcher.dispatch(&signed(&h, &env, Some("ops"))).await;
        assert_eq!(response.message, AUTH_FAILED);
    }

    #[tokio::test]
    async fn test_bare_secrets_report_names_only() {
        let h = harness();
        let env = sealed(&h, &[("A", "1"), ("B", "2")]);
        let response = h.dispatcher.dispatch(&signed(&h, &env, Some("ops"))).await;
        assert!(response.success);
        assert_eq!(response.payload.unwrap()["variables"], json!(["A", "B"]));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_structured_failures() {
        let h = harness();
        let cases = [
            (Command::new("explode"), "unknown command"),
            (Command::new("deploy").with_arg("name", "api"), "image is required"),
            (Command::new("logs").with_arg("name", "../etc"), "invalid app name"),
            (
                Command::new("deploy")
                    .with_arg("name", "api")
                    .with_arg("image", "x")
                    .with_arg("domain", "api.example.com"),
                "no proxy admin",
            ),
        ];
        for (command, expected) in cases {
            let response = h.dispatcher.dispatch(&signed(&h, &command, Some("ops"))).await;
            assert!(!response.success);
            assert!(response.message.contains(expected), "{}", response.message);
        }

        let garbage = sign_envelope(b"not json".to_vec(), Some("ops".into()), &h.operator_key);
        let response = h.dispatcher.dispatch(&garbage).await;
        assert!(response.message.starts_with("malformed request"));
        assert!(h.engine.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_restart_status_logs() {
        let h = harness();
        let send = |c: Command| {
            let envelope = signed(&h, &c, Some("ops"));
            let dispatcher = &h.dispatcher;
            async move { dispatcher.dispatch(&envelope).await }
        };

        assert!(send(Command::new("restart").with_arg("name", "web")).await.success);
        let status = send(Command::new("status").with_arg("name", "web")).await;
        assert_eq!(status.payload.unwrap()[0]["container_name"], "web");

        let apps = h.supervisor.trigger_now().await.unwrap();
        assert_eq!(apps[0].status, AppStatus::Running);

        let logs = send(Command::new("logs").with_arg("name", "web").with_arg("tail", 2)).await;
        assert_eq!(logs.payload.unwrap()["lines"], json!(["line 0", "line 1"]));

        assert!(send(Command::new("stop").with_arg("name", "web")).await.success);
        assert!(h.supervisor.snapshot(None).await.unwrap().is_empty());
        let status = send(Command::new("status").with_arg("name", "web")).await;
        assert!(!status.success);
    }
}

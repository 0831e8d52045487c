// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Container Supervisor
//!
//! Single task that owns every [`MonitoredApp`] and reconciles it against the
//! container engine on a fixed interval. Other components never touch the app
//! map; they send intents through a [`SupervisorHandle`].
//!
//! ```text
//! SupervisorHandle ──Intent──▶ mpsc ──▶ supervisor task ──▶ ContainerEngine
//!                  ◀─oneshot──                  │
//!                                   ticker ─────┘ (one pass per interval)
//! ```
//!
//! A pass inspects each app (an inspect error counts as `stopped`), checks
//! health for running containers, then applies [`MonitoredApp::decide`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::daemon_config::SupervisorConfig;
use crate::domain::runtime::{
    ContainerEngine, ContainerError, ContainerInspection, HealthStatus, ObservedState, MANAGED_LABEL,
};
use crate::domain::supervisor::{AppStatus, DesiredState, HealthProbe, MonitoredApp, Reconcile, RestartPolicy};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor is not running")]
    Stopped,
    #[error("app {0} is not supervised")]
    UnknownApp(String),
    #[error("startup recovery failed: {0}")]
    Recovery(#[from] ContainerError),
}

enum Intent {
    Register(MonitoredApp, oneshot::Sender<()>),
    Unregister(String, oneshot::Sender<Option<MonitoredApp>>),
    ResetRestarts(String, oneshot::Sender<Result<(), SupervisorError>>),
    Snapshot(Option<String>, oneshot::Sender<Vec<MonitoredApp>>),
    TriggerNow(oneshot::Sender<Vec<MonitoredApp>>),
    Recover(oneshot::Sender<Result<usize, SupervisorError>>),
}

/// Cloneable front door to the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Intent>,
}

impl SupervisorHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Intent) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Start supervising `app`, replacing any previous record of the same name.
    pub async fn register(&self, app: MonitoredApp) -> Result<(), SupervisorError> {
        self.request(|reply| Intent::Register(app, reply)).await
    }

    pub async fn unregister(&self, name: &str) -> Result<Option<MonitoredApp>, SupervisorError> {
        self.request(|reply| Intent::Unregister(name.to_string(), reply)).await
    }

    /// Zero the restart counter, lifting an `exhausted` status.
    pub async fn reset_restarts(&self, name: &str) -> Result<(), SupervisorError> {
        self.request(|reply| Intent::ResetRestarts(name.to_string(), reply)).await?
    }

    /// One app, or every app sorted by name.
    pub async fn snapshot(&self, name: Option<&str>) -> Result<Vec<MonitoredApp>, SupervisorError> {
        self.request(|reply| Intent::Snapshot(name.map(str::to_string), reply)).await
    }

    /// Run one supervision pass now and return the resulting snapshot.
    pub async fn trigger_now(&self) -> Result<Vec<MonitoredApp>, SupervisorError> {
        self.request(Intent::TriggerNow).await
    }

    /// Register every daemon-managed container found in the engine, then run a
    /// pass. Returns how many apps were newly registered.
    pub async fn recover(&self) -> Result<usize, SupervisorError> {
        self.request(Intent::Recover).await?
    }
}

pub struct ContainerSupervisor {
    engine: Arc<dyn ContainerEngine>,
    probe: Arc<dyn HealthProbe>,
    config: SupervisorConfig,
    apps: HashMap<String, MonitoredApp>,
}

impl ContainerSupervisor {
    /// Spawn the supervisor task. It exits when `shutdown` fires or every
    /// handle is dropped.
    pub fn spawn(
        engine: Arc<dyn ContainerEngine>,
        probe: Arc<dyn HealthProbe>,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let supervisor = Self {
            engine,
            probe,
            config,
            apps: HashMap::new(),
        };
        let task = tokio::spawn(supervisor.run(rx, shutdown));
        (SupervisorHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Intent>, shutdown: CancellationToken) {
        let period = self.config.interval().max(Duration::from_secs(1));
        info!(interval_secs = period.as_secs(), "Container supervisor started");

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.pass().await,
                intent = rx.recv() => match intent {
                    Some(intent) => self.handle(intent).await,
                    None => break,
                },
            }
        }
        info!(apps = self.apps.len(), "Container supervisor stopped");
    }

    async fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::Register(app, reply) => {
                info!(
                    app = %app.container_name,
                    policy = %app.restart_policy,
                    max_restarts = app.max_restarts,
                    "Supervising app"
                );
                self.apps.insert(app.container_name.clone(), app);
                let _ = reply.send(());
            }
            Intent::Unregister(name, reply) => {
                let removed = self.apps.remove(&name);
                if removed.is_some() {
                    info!(app = %name, "Stopped supervising app");
                }
                let _ = reply.send(removed);
            }
            Intent::ResetRestarts(name, reply) => {
                let result = match self.apps.get_mut(&name) {
                    Some(app) => {
                        app.reset_restarts();
                        app.desired_state = DesiredState::Running;
                        info!(app = %name, "Restart counter reset");
                        Ok(())
                    }
                    None => Err(SupervisorError::UnknownApp(name)),
                };
                let _ = reply.send(result);
            }
            Intent::Snapshot(name, reply) => {
                let _ = reply.send(self.snapshot(name.as_deref()));
            }
            Intent::TriggerNow(reply) => {
                self.pass().await;
                let _ = reply.send(self.snapshot(None));
            }
            Intent::Recover(reply) => {
                let result = self.recover().await;
                let _ = reply.send(result);
            }
        }
    }

    fn snapshot(&self, name: Option<&str>) -> Vec<MonitoredApp> {
        let mut apps: Vec<MonitoredApp> = match name {
            Some(name) => self.apps.get(name).cloned().into_iter().collect(),
            None => self.apps.values().cloned().collect(),
        };
        apps.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        apps
    }

    async fn recover(&mut self) -> Result<usize, SupervisorError> {
        let selector = format!("{}=true", MANAGED_LABEL);
        let containers = self.engine.list_by_label(&selector).await?;
        let mut registered = 0;
        for container in containers {
            if container.name.is_empty() || self.apps.contains_key(&container.name) {
                continue;
            }
            let app = MonitoredApp::new(
                container.name.clone(),
                RestartPolicy::Always,
                self.config.default_max_restarts,
            );
            self.apps.insert(container.name, app);
            registered += 1;
        }
        info!(recovered = registered, "Recovered managed containers");
        self.pass().await;
        Ok(registered)
    }

    async fn pass(&mut self) {
        let mut names: Vec<String> = self.apps.keys().cloned().collect();
        names.sort();
        for name in names {
            self.reconcile(&name).await;
        }
    }

    async fn healthy(&self, view: &ContainerInspection) -> bool {
        match view.health {
            HealthStatus::Healthy | HealthStatus::Starting => true,
            HealthStatus::Unhealthy => false,
            HealthStatus::None => self.probe.probe(&view.published_ports).await,
        }
    }

    async fn reconcile(&mut self, name: &str) {
        let (observed, healthy, inspect_error) = match self.engine.inspect(name).await {
            Ok(view) if view.state == ObservedState::Running => {
                let healthy = self.healthy(&view).await;
                (view.state, healthy, None)
            }
            Ok(view) => (view.state, true, None),
            Err(e) => {
                debug!(app = %name, error = %e, "Inspect failed, treating as stopped");
                (ObservedState::Stopped, true, Some(e.to_string()))
            }
        };

        let now = Utc::now();
        let engine = Arc::clone(&self.engine);
        let grace = self.config.stop_grace();
        let (base, max) = (self.config.backoff_base(), self.config.backoff_max());
        let Some(app) = self.apps.get_mut(name) else {
            return;
        };
        app.last_checked_at = Some(now);
        if inspect_error.is_some() {
            app.last_error = inspect_error;
        }

        match app.decide(observed, healthy) {
            Reconcile::Observe(status) => {
                if status == AppStatus::Running {
                    app.last_error = None;
                }
                app.status = status;
            }
            Reconcile::Exhausted => {
                if app.status != AppStatus::Exhausted {
                    warn!(
                        app = %name,
                        restarts = app.restart_count,
                        "Restart limit reached, automatic restarts disabled"
                    );
                }
                app.status = AppStatus::Exhausted;
            }
            Reconcile::Restart => {
                if let Some(last) = app.last_restart_at {
                    let wait = backoff_delay(base, max, app.restart_count);
                    let elapsed = (now - last).to_std().unwrap_or_default();
                    if elapsed < wait {
                        debug!(app = %name, remaining_secs = (wait - elapsed).as_secs(), "Restart backoff pending");
                        return;
                    }
                }

                app.restart_count += 1;
                app.last_restart_at = Some(now);
                app.status = AppStatus::Restarting;
                let attempt = app.restart_count;
                info!(app = %name, attempt, observed = ?observed, healthy, "Restarting app");

                let result = match engine.stop(name, grace).await {
                    Ok(()) | Err(ContainerError::NotFound(_)) => engine.start(name).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => info!(app = %name, attempt, "Restart issued"),
                    Err(e) => {
                        error!(app = %name, attempt, error = %e, "Restart failed");
                        app.status = AppStatus::Failed;
                        app.last_error = Some(e.to_string());
                    }
                }
            }
        }
    }
}

/// `min(base * 2^(n-1), max)` after the n-th consecutive restart.
fn backoff_delay(base: Duration, max: Duration, n: u32) -> Duration {
    if base.is_zero() || n == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32 << (n - 1).min(20);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::runtime::{ContainerSpec, ContainerSummary};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Clone)]
    struct Observed {
        state: ObservedState,
        health: HealthStatus,
        ports: Vec<u16>,
    }

    #[derive(Default)]
    struct MockEngine {
        containers: Mutex<HashMap<String, Observed>>,
        calls: Mutex<Vec<String>>,
        fail_start: Mutex<bool>,
    }

    impl MockEngine {
        fn set(&self, name: &str, state: ObservedState, health: HealthStatus) {
            self.containers.lock().insert(
                name.to_string(),
                Observed {
                    state,
                    health,
                    ports: vec![8080],
                },
            );
        }

        fn starts(&self, name: &str) -> usize {
            let needle = format!("start:{}", name);
            self.calls.lock().iter().filter(|c| **c == needle).count()
        }
    }

    #[async_trait]
    impl ContainerEngine for MockEngine {
        async fn ping(&self) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn ensure_image(&self, _image: &str) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
            Ok(spec.name.clone())
        }
        async fn start(&self, name: &str) -> Result<(), ContainerError> {
            self.calls.lock().push(format!("start:{}", name));
            if *self.fail_start.lock() {
                return Err(ContainerError::Engine("port is already allocated".into()));
            }
            Ok(())
        }
        async fn stop(&self, name: &str, _grace: Duration) -> Result<(), ContainerError> {
            self.calls.lock().push(format!("stop:{}", name));
            Ok(())
        }
        async fn remove(&self, _name: &str, _force: bool) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn inspect(&self, name: &str) -> Result<ContainerInspection, ContainerError> {
            let observed = self
                .containers
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
            Ok(ContainerInspection {
                id: name.to_string(),
                name: name.to_string(),
                image: "img".to_string(),
                state: observed.state,
                exit_code: None,
                health: observed.health,
                published_ports: observed.ports,
                labels: HashMap::new(),
            })
        }
        async fn logs(&self, _name: &str, _tail: usize) -> Result<Vec<String>, ContainerError> {
            Ok(Vec::new())
        }
        async fn list_by_label(&self, label: &str) -> Result<Vec<ContainerSummary>, ContainerError> {
            assert_eq!(label, "shipyard.managed=true");
            Ok(self
                .containers
                .lock()
                .keys()
                .map(|name| ContainerSummary {
                    id: name.clone(),
                    name: name.clone(),
                    image: "img".to_string(),
                    status: "running".to_string(),
                    labels: HashMap::new(),
                })
                .collect())
        }
    }

    struct FixedProbe(bool);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self, _ports: &[u16]) -> bool {
            self.0
        }
    }

    fn no_backoff() -> SupervisorConfig {
        SupervisorConfig {
            backoff_base_secs: 0,
            ..Default::default()
        }
    }

    fn start(engine: Arc<MockEngine>, probe: bool, config: SupervisorConfig) -> SupervisorHandle {
        let (handle, _task) = ContainerSupervisor::spawn(
            engine,
            Arc::new(FixedProbe(probe)),
            config,
            CancellationToken::new(),
        );
        handle
    }

    #[tokio::test]
    async fn test_restart_cap_stops_after_max_restarts() {
        let engine = Arc::new(MockEngine::default());
        engine.set("web", ObservedState::Stopped, HealthStatus::None);
        let handle = start(engine.clone(), true, no_backoff());
        handle
            .register(MonitoredApp::new("web", RestartPolicy::Always, 3))
            .await
            .unwrap();

        for _ in 0..3 {
            handle.trigger_now().await.unwrap();
        }
        let app = handle.snapshot(Some("web")).await.unwrap().remove(0);
        assert_eq!(app.restart_count, 3);
        assert_eq!(engine.starts("web"), 3);

        let app = handle.trigger_now().await.unwrap().remove(0);
        assert_eq!(app.restart_count, 3);
        assert_eq!(app.status, AppStatus::Exhausted);
        assert_eq!(engine.starts("web"), 3);

        // coming back on its own does not clear the cap
        engine.set("web", ObservedState::Running, HealthStatus::None);
        let app = handle.trigger_now().await.unwrap().remove(0);
        assert_eq!(app.status, AppStatus::Exhausted);
        engine.set("web", ObservedState::Stopped, HealthStatus::None);

        handle.reset_restarts("web").await.unwrap();
        handle.trigger_now().await.unwrap();
        assert_eq!(engine.starts("web"), 4);
    }

    #[tokio::test]
    async fn test_missing_container_is_treated_as_stopped() {
        let engine = Arc::new(MockEngine::default());
        let handle = start(engine.clone(), true, no_backoff());
        handle
            .register(MonitoredApp::new("ghost", RestartPolicy::Always, -1))
            .await
            .unwrap();

        let app = handle.trigger_now().await.unwrap().remove(0);
        assert_eq!(app.restart_count, 1);
        assert_eq!(app.status, AppStatus::Restarting);
        assert!(app.last_error.unwrap().contains("ghost"));
        assert_eq!(
            *engine.calls.lock(),
            vec!["stop:ghost".to_string(), "start:ghost".to_string()]
        );
    }

    #[tokio::test]
    async fn test_native_health_takes_precedence_over_probe() {
        let engine = Arc::new(MockEngine::default());
        engine.set("api", ObservedState::Running, HealthStatus::Unhealthy);
        engine.set("db", ObservedState::Running, HealthStatus::Healthy);
        // the probe would say everything is down
        let handle = start(engine.clone(), false, no_backoff());
        for name in ["api", "db"] {
            handle
                .register(MonitoredApp::new(name, RestartPolicy::OnFailure, 5))
                .await
                .unwrap();
        }

        let apps = handle.trigger_now().await.unwrap();
        assert_eq!(apps[0].status, AppStatus::Restarting);
        assert_eq!(apps[1].status, AppStatus::Running);
        assert_eq!(engine.starts("api"), 1);
        assert_eq!(engine.starts("db"), 0);
    }

    #[tokio::test]
    async fn test_probe_decides_without_native_health() {
        let engine = Arc::new(MockEngine::default());
        engine.set("web", ObservedState::Running, HealthStatus::None);

        let unreachable = start(engine.clone(), false, no_backoff());
        unreachable
            .register(MonitoredApp::new("web", RestartPolicy::Always, 5))
            .await
            .unwrap();
        unreachable.trigger_now().await.unwrap();
        assert_eq!(engine.starts("web"), 1);

        let reachable = start(engine.clone(), true, no_backoff());
        reachable
            .register(MonitoredApp::new("web", RestartPolicy::Always, 5))
            .await
            .unwrap();
        let app = reachable.trigger_now().await.unwrap().remove(0);
        assert_eq!(app.status, AppStatus::Running);
        assert_eq!(engine.starts("web"), 1);
    }

    #[tokio::test]
    async fn test_backoff_defers_consecutive_restarts() {
        let engine = Arc::new(MockEngine::default());
        engine.set("web", ObservedState::Failed, HealthStatus::None);
        let config = SupervisorConfig {
            backoff_base_secs: 60,
            ..Default::default()
        };
        let handle = start(engine.clone(), true, config);
        handle
            .register(MonitoredApp::new("web", RestartPolicy::Always, 10))
            .await
            .unwrap();

        handle.trigger_now().await.unwrap();
        let app = handle.trigger_now().await.unwrap().remove(0);
        assert_eq!(app.restart_count, 1);
        assert_eq!(engine.starts("web"), 1);
    }

    #[tokio::test]
    async fn test_failed_restart_records_error() {
        let engine = Arc::new(MockEngine::default());
        engine.set("web", ObservedState::Stopped, HealthStatus::None);
        *engine.fail_start.lock() = true;
        let handle = start(engine.clone(), true, no_backoff());
        handle
            .register(MonitoredApp::new("web", RestartPolicy::Always, 3))
            .await
            .unwrap();

        let app = handle.trigger_now().await.unwrap().remove(0);
        assert_eq!(app.status, AppStatus::Failed);
        assert!(app.last_error.unwrap().contains("already allocated"));
    }

    #[tokio::test]
    async fn test_recover_registers_managed_containers() {
        let engine = Arc::new(MockEngine::default());
        engine.set("api", ObservedState::Running, HealthStatus::Healthy);
        engine.set("worker", ObservedState::Stopped, HealthStatus::None);
        let handle = start(engine.clone(), true, no_backoff());

        assert_eq!(handle.recover().await.unwrap(), 2);
        let apps = handle.snapshot(None).await.unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].container_name, "api");
        assert_eq!(apps[0].status, AppStatus::Running);
        assert_eq!(apps[1].restart_policy, RestartPolicy::Always);
        assert_eq!(apps[1].max_restarts, 5);
        assert_eq!(engine.starts("worker"), 1);

        assert_eq!(handle.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_app_and_shutdown() {
        let engine = Arc::new(MockEngine::default());
        let shutdown = CancellationToken::new();
        let (handle, task) = ContainerSupervisor::spawn(
            engine,
            Arc::new(FixedProbe(true)),
            no_backoff(),
            shutdown.clone(),
        );
        assert!(matches!(
            handle.reset_restarts("nope").await,
            Err(SupervisorError::UnknownApp(_))
        ));
        assert!(handle.unregister("nope").await.unwrap().is_none());

        shutdown.cancel();
        task.await.unwrap();
        assert!(matches!(handle.snapshot(None).await, Err(SupervisorError::Stopped)));
    }
}

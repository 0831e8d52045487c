// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground daemon: key store, container supervision and the HTTP API

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shipyard_core::application::dispatcher::{CommandDispatcher, DispatchSettings};
use shipyard_core::application::proxy_configurator::ProxyConfigurator;
use shipyard_core::application::supervisor::ContainerSupervisor;
use shipyard_core::domain::daemon_config::DaemonConfigManifest;
use shipyard_core::domain::keys::{KeyError, TrustStore};
use shipyard_core::domain::runtime::ContainerEngine;
use shipyard_core::infrastructure::health_probe::TcpHealthProbe;
use shipyard_core::infrastructure::key_store::FileKeyStore;
use shipyard_core::infrastructure::proxy::CaddyAdminClient;
use shipyard_core::infrastructure::runtime::DockerEngine;
use shipyard_core::presentation::api::{app, AppState};

use crate::logging::init_logging;

const KEY_MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

pub async fn run_daemon(config_path: Option<PathBuf>, log_level: Option<String>) -> Result<()> {
    let mut config =
        DaemonConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    if let Some(level) = log_level {
        config.spec.logging.level = level;
    }
    config.validate().context("Invalid daemon configuration")?;
    init_logging(&config.spec.logging.level, &config.spec.logging.format)?;

    let spec = &config.spec;
    info!(
        name = %config.metadata.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting shipyard daemon"
    );

    // Key material first: without entropy the daemon must not start at all.
    let keys = match FileKeyStore::open_or_init(
        &spec.keys.directory,
        Duration::from_secs(spec.keys.rotation_grace_secs),
    ) {
        Ok(store) => Arc::new(store),
        Err(KeyError::Entropy(reason)) => {
            error!(%reason, "Entropy source unavailable, refusing to start");
            anyhow::bail!("entropy source unavailable: {}", reason);
        }
        Err(e) => return Err(e).context("Failed to open key store"),
    };
    let active = keys.active();
    info!(
        key_id = %active.key_id.short(),
        fingerprint = %active.sign_fingerprint(),
        peers = keys.peers().len(),
        "Key store ready"
    );

    let engine: Arc<dyn ContainerEngine> = Arc::new(
        DockerEngine::new(spec.runtime.docker_socket.as_deref())
            .context("Failed to connect to Docker")?,
    );
    if let Err(e) = engine.ping().await {
        warn!(error = %e, "Docker is not responding yet, readiness will report it");
    }

    let shutdown = CancellationToken::new();
    let probe = Arc::new(TcpHealthProbe::new("127.0.0.1", spec.supervisor.probe_timeout()));
    let (supervisor, supervisor_task) =
        ContainerSupervisor::spawn(engine.clone(), probe, spec.supervisor.clone(), shutdown.clone());

    match supervisor.recover().await {
        Ok(0) => info!("No managed containers to recover"),
        Ok(count) => info!(count, "Recovered managed containers"),
        Err(e) => warn!(error = %e, "Container recovery failed, continuing with an empty set"),
    }

    let settings = DispatchSettings {
        default_max_restarts: spec.supervisor.default_max_restarts,
        stop_grace: spec.supervisor.stop_grace(),
    };
    let mut dispatcher = CommandDispatcher::new(keys.clone(), engine.clone(), supervisor.clone(), settings);
    if let Some(url) = &spec.proxy.admin_url {
        info!(admin = %url, server = %spec.proxy.server_name, "Managing reverse proxy routes");
        let admin = Arc::new(CaddyAdminClient::new(url.as_str()));
        dispatcher = dispatcher.with_proxy(Arc::new(ProxyConfigurator::new(admin, &spec.proxy.server_name)));
    }

    let maintenance = tokio::spawn(key_maintenance(
        keys.clone(),
        spec.keys.rotation_interval_secs.map(Duration::from_secs),
        shutdown.clone(),
    ));

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        engine,
        supervisor,
        trust_store: keys,
        started_at: Instant::now(),
    };

    let addr = format!("{}:{}", spec.network.bind_address, spec.network.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Daemon listening on {}", addr);

    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server failed");

    shutdown.cancel();
    if let Err(e) = supervisor_task.await {
        warn!(error = %e, "Supervisor task ended abnormally");
    }
    let _ = maintenance.await;
    info!("Daemon stopped");
    served
}

/// Pick up peer and key changes made by `shipyard keys trust|revoke|rotate`,
/// prune retired keys, and rotate the active key once it is older than
/// `rotation_interval`.
async fn key_maintenance(
    keys: Arc<FileKeyStore>,
    rotation_interval: Option<Duration>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(KEY_MAINTENANCE_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Err(e) = keys.reload_peers() {
            warn!(error = %e, "Failed to reload trusted peers");
        }
        if let Err(e) = keys.reload_keys() {
            warn!(error = %e, "Failed to reload daemon keys");
        }
        if let Err(e) = keys.prune_retired() {
            warn!(error = %e, "Failed to prune retired keys");
        }
        if let Some(interval) = rotation_interval {
            let age = chrono::Utc::now() - keys.active().created_at;
            if age.to_std().map(|age| age >= interval).unwrap_or(false) {
                if let Err(e) = keys.rotate() {
                    error!(error = %e, "Scheduled key rotation failed");
                }
            }
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
        _ = shutdown.cancelled() => {},
    }
}

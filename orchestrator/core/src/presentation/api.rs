// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::debug;

use crate::application::dispatcher::CommandDispatcher;
use crate::application::supervisor::SupervisorHandle;
use crate::domain::envelope::{Envelope, Response};
use crate::domain::keys::{PublicIdentity, TrustStore};
use crate::domain::runtime::ContainerEngine;

pub struct AppState {
    pub dispatcher: Arc<CommandDispatcher>,
    pub engine: Arc<dyn ContainerEngine>,
    pub supervisor: SupervisorHandle,
    pub trust_store: Arc<dyn TrustStore>,
    pub started_at: Instant,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/commands", post(submit_command))
        .route("/v1/identity", get(identity))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(Arc::new(state))
}

async fn submit_command(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Malformed envelope");
            return (
                StatusCode::BAD_REQUEST,
                Json(Response::failure(format!("malformed envelope: {}", e))),
            );
        }
    };
    (StatusCode::OK, Json(state.dispatcher.dispatch(&envelope).await))
}

async fn identity(State(state): State<Arc<AppState>>) -> Json<PublicIdentity> {
    Json(PublicIdentity::from(state.trust_store.active().as_ref()))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(e) = state.engine.ping().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "reason": e.to_string() })),
        );
    }
    match state.supervisor.snapshot(None).await {
        Ok(apps) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "apps": apps.len() })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "reason": e.to_string() })),
        ),
    }
}

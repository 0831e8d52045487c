// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Route management on top of [`ProxyAdmin`]. Every change is built as a full
//! candidate config and validated before anything is loaded.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::domain::proxy::{ProxyAdmin, ProxyError};

const ROUTE_ID_PREFIX: &str = "shipyard-";

pub struct ProxyConfigurator {
    admin: Arc<dyn ProxyAdmin>,
    server_name: String,
}

impl ProxyConfigurator {
    pub fn new(admin: Arc<dyn ProxyAdmin>, server_name: impl Into<String>) -> Self {
        Self {
            admin,
            server_name: server_name.into(),
        }
    }

    /// Validate `config`, then load it. On validation failure nothing is loaded.
    pub async fn apply(&self, config: &Value) -> Result<(), ProxyError> {
        if let Err(e) = self.admin.validate(config).await {
            warn!(error = %e, "Proxy config rejected, keeping current config");
            return Err(e);
        }
        self.admin.load(config).await?;
        info!("Proxy config loaded");
        Ok(())
    }

    /// Route `domain` to `127.0.0.1:<upstream_port>`, replacing an existing route
    /// for the same app.
    pub async fn upsert_route(&self, app: &str, domain: &str, upstream_port: u16) -> Result<(), ProxyError> {
        let mut config = self.current().await?;
        let server = self.server_mut(&mut config);
        let id = route_id(app);
        let mut routes = take_routes(server);
        routes.retain(|r| r.get("@id").and_then(Value::as_str) != Some(id.as_str()));
        routes.push(route(app, domain, upstream_port));
        let routes = Value::Array(routes);
        server["routes"] = routes.clone();

        self.admin.validate(&config).await.inspect_err(|e| {
            warn!(app = %app, domain = %domain, error = %e, "Route rejected by proxy validation");
        })?;
        self.admin.patch(&self.routes_path(), &routes).await?;
        info!(app = %app, domain = %domain, upstream_port, "Proxy route updated");
        Ok(())
    }

    /// Remove the app's route. Returns `false` when there was none.
    pub async fn remove_route(&self, app: &str) -> Result<bool, ProxyError> {
        let mut config = self.current().await?;
        let server = self.server_mut(&mut config);
        let id = route_id(app);
        let mut routes = take_routes(server);
        let before = routes.len();
        routes.retain(|r| r.get("@id").and_then(Value::as_str) != Some(id.as_str()));
        if routes.len() == before {
            return Ok(false);
        }
        let routes = Value::Array(routes);
        server["routes"] = routes.clone();

        self.admin.validate(&config).await?;
        self.admin.patch(&self.routes_path(), &routes).await?;
        info!(app = %app, "Proxy route removed");
        Ok(true)
    }

    async fn current(&self) -> Result<Value, ProxyError> {
        let config = self.admin.get_config().await?;
        Ok(if config.is_object() { config } else { json!({}) })
    }

    fn routes_path(&self) -> String {
        format!("apps/http/servers/{}/routes", self.server_name)
    }

    /// Walk to this daemon's HTTP server block, creating the skeleton on the way.
    fn server_mut<'a>(&self, config: &'a mut Value) -> &'a mut Value {
        let apps = ensure_object(config, "apps");
        let http = ensure_object(apps, "http");
        let servers = ensure_object(http, "servers");
        let server = ensure_object(servers, &self.server_name);
        if !server.get("listen").is_some_and(Value::is_array) {
            server["listen"] = json!([":443", ":80"]);
        }
        server
    }
}

fn take_routes(server: &mut Value) -> Vec<Value> {
    match server.get_mut("routes").map(Value::take) {
        Some(Value::Array(routes)) => routes,
        _ => Vec::new(),
    }
}

fn ensure_object<'a>(parent: &'a mut Value, key: &str) -> &'a mut Value {
    if !parent.get(key).is_some_and(Value::is_object) {
        parent[key] = json!({});
    }
    &mut parent[key]
}

fn route_id(app: &str) -> String {
    format!("{}{}", ROUTE_ID_PREFIX, app)
}

fn route(app: &str, domain: &str, upstream_port: u16) -> Value {
    json!({
        "@id": route_id(app),
        "match": [{ "host": [domain] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": format!("127.0.0.1:{}", upstream_port) }]
        }],
        "terminal": true
    })
}

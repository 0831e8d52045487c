// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Caddy Admin API Adapter
//
// Thin HTTP client over Caddy's JSON admin endpoint. Validation goes to a
// separate endpoint (default `/validate`) so a config is always checked
// before `/load` or a `PATCH` replaces anything.

use crate::domain::proxy::{ProxyAdmin, ProxyError};
use async_trait::async_trait;
use serde_json::Value;

pub struct CaddyAdminClient {
    client: reqwest::Client,
    endpoint: String,
    validate_path: String,
}

impl CaddyAdminClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            validate_path: "/validate".to_string(),
        }
    }

    pub fn with_validate_path(mut self, path: impl Into<String>) -> Self {
        self.validate_path = path.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ProxyError::Status { status, body })
    }
}

fn http_err(e: reqwest::Error) -> ProxyError {
    ProxyError::Http(e.to_string())
}

#[async_trait]
impl ProxyAdmin for CaddyAdminClient {
    async fn get_config(&self) -> Result<Value, ProxyError> {
        let response = self
            .client
            .get(self.url("/config/"))
            .send()
            .await
            .map_err(http_err)?;
        let response = Self::check(response).await?;
        let body = response.text().await.map_err(http_err)?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ProxyError::Http(format!("invalid config JSON: {}", e)))
    }

    async fn validate(&self, config: &Value) -> Result<(), ProxyError> {
        let response = self
            .client
            .post(self.url(&self.validate_path))
            .json(config)
            .send()
            .await
            .map_err(http_err)?;
        match Self::check(response).await {
            Ok(_) => Ok(()),
            Err(ProxyError::Status { status, body }) if (400..500).contains(&status) => {
                Err(ProxyError::ConfigValidation(body))
            }
            Err(e) => Err(e),
        }
    }

    async fn load(&self, config: &Value) -> Result<(), ProxyError> {
        let response = self
            .client
            .post(self.url("/load"))
            .json(config)
            .send()
            .await
            .map_err(http_err)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn patch(&self, path: &str, value: &Value) -> Result<(), ProxyError> {
        let url = self.url(&format!("/config/{}", path.trim_start_matches('/')));
        let response = self
            .client
            .patch(url)
            .json(value)
            .send()
            .await
            .map_err(http_err)?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_config_handles_empty_and_json() {
        let mut server = mockito::Server::new_async().await;
        let empty = server
            .mock("GET", "/config/")
            .with_status(200)
            .with_body("null")
            .create_async()
            .await;
        let client = CaddyAdminClient::new(server.url());
        assert_eq!(client.get_config().await.unwrap(), Value::Null);
        empty.assert_async().await;
    }

    #[tokio::test]
    async fn test_validate_rejection_is_config_validation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/validate")
            .match_header("content-type", "application/json")
            .with_status(400)
            .with_body("unknown handler: reverse_proxie")
            .create_async()
            .await;
        let client = CaddyAdminClient::new(format!("{}/", server.url()));
        let err = client.validate(&json!({"apps": {}})).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConfigValidation(ref body) if body.contains("reverse_proxie")));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_load_and_patch_hit_admin_paths() {
        let mut server = mockito::Server::new_async().await;
        let load = server
            .mock("POST", "/load")
            .match_body(mockito::Matcher::Json(json!({"apps": {"http": {}}})))
            .with_status(200)
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/config/apps/http/servers/shipyard/routes")
            .with_status(200)
            .create_async()
            .await;
        let failing = server
            .mock("PATCH", "/config/apps/tls")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = CaddyAdminClient::new(server.url());
        client.load(&json!({"apps": {"http": {}}})).await.unwrap();
        client
            .patch("/apps/http/servers/shipyard/routes", &json!([]))
            .await
            .unwrap();
        let err = client.patch("apps/tls", &json!({})).await.unwrap_err();
        assert!(matches!(err, ProxyError::Status { status: 500, .. }));

        load.assert_async().await;
        patch.assert_async().await;
        failing.assert_async().await;
    }
}

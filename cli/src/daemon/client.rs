// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for communicating with daemon API
//!
//! Every request body is signed with the CLI identity before it leaves the process.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use shipyard_core::domain::envelope::{Command, EncryptedEnv, Envelope, Response};
use shipyard_core::domain::keys::PublicIdentity;
use shipyard_core::infrastructure::crypto::sign_envelope;
use shipyard_core::infrastructure::key_store::CliIdentity;

pub struct DaemonClient {
    client: Client,
    base_url: String,
    identity: CliIdentity,
}

impl DaemonClient {
    pub fn new(base_url: &str, identity: CliIdentity) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            // image pulls during deploy can take minutes
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            identity,
        })
    }

    pub fn identity(&self) -> &CliIdentity {
        &self.identity
    }

    /// Sign and submit an operator command.
    pub async fn send(&self, command: &Command) -> Result<Response> {
        self.submit(command).await
    }

    /// Submit a bare secret set; the daemon answers with the variable names it decrypted.
    pub async fn check_secrets(&self, env: &EncryptedEnv) -> Result<Response> {
        self.submit(env).await
    }

    async fn submit<T: Serialize>(&self, body: &T) -> Result<Response> {
        let payload = serde_json::to_vec(body).context("Failed to encode request")?;
        let envelope = self.seal(payload);

        let response = self
            .client
            .post(format!("{}/v1/commands", self.base_url))
            .json(&envelope)
            .send()
            .await
            .context("Failed to reach daemon")?;

        // malformed requests still carry a structured body
        let status = response.status();
        if !(status.is_success() || status == StatusCode::BAD_REQUEST) {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Daemon returned {}: {}", status, error_text);
        }

        response
            .json::<Response>()
            .await
            .context("Failed to parse daemon response")
    }

    fn seal(&self, payload: Vec<u8>) -> Envelope {
        sign_envelope(
            payload,
            Some(self.identity.name.clone()),
            self.identity.sign_private.expose(),
        )
    }

    /// Active daemon key, used to seal secrets when none is pinned in the config.
    pub async fn daemon_identity(&self) -> Result<PublicIdentity> {
        let response = self
            .client
            .get(format!("{}/v1/identity", self.base_url))
            .send()
            .await
            .context("Failed to reach daemon")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to fetch daemon identity: {}", error_text);
        }

        response
            .json()
            .await
            .context("Failed to parse daemon identity")
    }
}

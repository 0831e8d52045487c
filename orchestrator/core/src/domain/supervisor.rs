// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Supervision Domain
//!
//! Desired-state records for managed containers and the pure reconcile
//! decision the supervisor loop applies to each of them.
//!
//! ## Decision Table
//! | Desired | Observed (after health) | Policy | Cap reached | Action |
//! |---------|-------------------------|--------|-------------|--------|
//! | stopped | any | any | any | none |
//! | running | any, while status is `exhausted` | any | any | none, status `exhausted` |
//! | running | running + healthy | any | any | none, status `running` |
//! | running | stopped / failed | never | any | none, status mirrors observation |
//! | running | stopped (clean exit) | on-failure | any | none, status `stopped` |
//! | running | stopped / failed | always, on-failure | no | restart |
//! | running | stopped / failed | always, on-failure | yes | none, status `exhausted` |
//!
//! A running container that fails its health check counts as `failed`.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::runtime::ObservedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "always" => Ok(Self::Always),
            "on-failure" => Ok(Self::OnFailure),
            "never" | "no" => Ok(Self::Never),
            other => Err(format!(
                "unknown restart policy '{}', expected always, on-failure or never",
                other
            )),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::Never => "never",
        })
    }
}

/// Supervisor-facing status of one app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Unknown,
    Running,
    Restarting,
    Stopped,
    Failed,
    /// Restart cap reached; sticky until the counter is reset.
    Exhausted,
}

/// `max_restarts` value meaning "no cap".
pub const UNLIMITED_RESTARTS: i32 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredApp {
    pub container_name: String,
    pub desired_state: DesiredState,
    pub restart_policy: RestartPolicy,
    /// `-1` means unlimited.
    pub max_restarts: i32,
    pub restart_count: u32,
    pub status: AppStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_restart_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MonitoredApp {
    pub fn new(container_name: impl Into<String>, restart_policy: RestartPolicy, max_restarts: i32) -> Self {
        Self {
            container_name: container_name.into(),
            desired_state: DesiredState::Running,
            restart_policy,
            max_restarts,
            restart_count: 0,
            status: AppStatus::Unknown,
            last_checked_at: None,
            last_restart_at: None,
            last_error: None,
        }
    }

    pub fn restarts_exhausted(&self) -> bool {
        self.max_restarts >= 0 && self.restart_count >= self.max_restarts as u32
    }

    /// Clear the restart counter and any sticky `exhausted` status.
    pub fn reset_restarts(&mut self) {
        self.restart_count = 0;
        self.last_restart_at = None;
        if self.status == AppStatus::Exhausted {
            self.status = AppStatus::Unknown;
        }
    }

    /// Decide what one supervision pass should do given the engine's view.
    ///
    /// `healthy` is only consulted for running containers.
    pub fn decide(&self, observed: ObservedState, healthy: bool) -> Reconcile {
        if self.desired_state == DesiredState::Stopped {
            return Reconcile::Observe(match observed {
                ObservedState::Running => AppStatus::Running,
                ObservedState::Restarting => AppStatus::Restarting,
                ObservedState::Stopped => AppStatus::Stopped,
                ObservedState::Failed => AppStatus::Failed,
            });
        }

        // sticky until reset_restarts, even if the container comes back on its own
        if self.status == AppStatus::Exhausted {
            return Reconcile::Exhausted;
        }

        let effective = match observed {
            ObservedState::Running if healthy => return Reconcile::Observe(AppStatus::Running),
            ObservedState::Running => ObservedState::Failed,
            // the engine is already restarting it; do not race it
            ObservedState::Restarting => return Reconcile::Observe(AppStatus::Restarting),
            other => other,
        };
        let observed_status = if effective == ObservedState::Failed {
            AppStatus::Failed
        } else {
            AppStatus::Stopped
        };

        match self.restart_policy {
            RestartPolicy::Never => Reconcile::Observe(observed_status),
            RestartPolicy::OnFailure if effective == ObservedState::Stopped => {
                Reconcile::Observe(AppStatus::Stopped)
            }
            _ if self.restarts_exhausted() => Reconcile::Exhausted,
            _ => Reconcile::Restart,
        }
    }
}

/// Outcome of [`MonitoredApp::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// No action; record the status.
    Observe(AppStatus),
    /// Stop then start, counting one restart.
    Restart,
    /// Cap reached; no action.
    Exhausted,
}

/// Best-effort application reachability check on published host ports.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` when the app answers on at least one port, or has no ports.
    async fn probe(&self, ports: &[u16]) -> bool;
}

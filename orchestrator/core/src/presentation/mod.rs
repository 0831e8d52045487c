// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`shipyard-core`)
//!
//! HTTP surface of the daemon. Requests are handed to
//! [`crate::application::dispatcher::CommandDispatcher`]; no business logic
//! lives here.
//!
//! | Route | Method | Description |
//! |-------|--------|-------------|
//! | `/v1/commands` | POST | Signed envelope in, structured response out |
//! | `/v1/identity` | GET | Active daemon public keys and fingerprints |
//! | `/health` | GET | Liveness and uptime |
//! | `/ready` | GET | Container engine reachable, supervisor running |

pub mod api;

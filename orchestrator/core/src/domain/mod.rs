// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Types, invariants and seam traits shared by every layer.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Keys and wire types, fleet and container models, supervision rules

pub mod keys;
pub mod envelope;
pub mod fleet;
pub mod runtime;
pub mod supervisor;
pub mod proxy;
pub mod daemon_config;

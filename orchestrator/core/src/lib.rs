// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Trust and execution core of the shipyard deployment daemon and CLI.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Key management, envelope codec, SSH fleet, container supervision

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! shipyard CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Operator commands, CLI configuration and the daemon entry point

pub mod commands;
pub mod config;
pub mod daemon;
pub mod logging;

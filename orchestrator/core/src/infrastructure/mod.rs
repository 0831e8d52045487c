// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod crypto;
pub mod key_store;
pub mod ssh;
pub mod fleet;
pub mod runtime;
pub mod health_probe;
pub mod proxy;

pub use fleet::FleetManager;
pub use key_store::{CliIdentity, FileKeyStore};

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod supervisor;
pub mod dispatcher;
pub mod remote_ops;
pub mod proxy_configurator;

// Re-export use cases for convenience
pub use dispatcher::{CommandDispatcher, DispatchError, DispatchSettings};
pub use remote_ops::{RemoteOperations, RemoteOpsError, StagedCredentials};
pub use supervisor::{ContainerSupervisor, SupervisorError, SupervisorHandle};

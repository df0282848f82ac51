// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator module - container engine backends.

pub mod docker;
pub mod mock;
mod traits;

pub use docker::{DockerCli, DockerCliConfig};
pub use mock::MockOrchestrator;
pub use traits::*;

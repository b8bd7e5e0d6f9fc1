// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! tfdist runtime
//!
//! Shared infrastructure for the TimeFrame distribution pipeline: the STF/TF
//! data model, the tagged wire codec, the region registry, the data-plane
//! transports (one-sided read emulation and the copy fallback), the control
//! RPC plane, and the key-value discovery store.
//!
//! Deployable processes live in `components/`: the scheduler (partition
//! coordinator), the sender (STF aggregator) and the builder (TF assembly).

pub use anyhow::{Context as ErrorContext, Error, Result, anyhow as error, bail as raise};

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod region;
pub mod rpc;
pub mod transport;

pub use config::RuntimeConfig;
pub use error::{DataError, TransportError};
pub use tokio_util::sync::CancellationToken;

/// Process role within a partition, used in heartbeats and discovery keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Scheduler,
    StfSender,
    TfBuilder,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Scheduler => write!(f, "scheduler"),
            ProcessRole::StfSender => write!(f, "sender"),
            ProcessRole::TfBuilder => write!(f, "builder"),
        }
    }
}

/// Partition lifecycle as observed through `GetPartitionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Configuring,
    Configured,
    Terminating,
    Terminated,
    Error,
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PartitionState::Configuring => "Configuring",
            PartitionState::Configured => "Configured",
            PartitionState::Terminating => "Terminating",
            PartitionState::Terminated => "Terminated",
            PartitionState::Error => "Error",
        };
        write!(f, "{name}")
    }
}

impl PartitionState {
    /// Final states are never left, regardless of later transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionState::Terminated | PartitionState::Error)
    }
}

/// Process exit codes shared by all component binaries.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const CONFIG: i32 = 2;
    pub const TRANSPORT_SETUP: i32 = 3;
    pub const PEER_AUTH: i32 = 4;
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane RPC.
//!
//! Reliable request/response over a length-delimited JSON framing. Each
//! role exposes one service trait; the TCP client implements the same trait
//! so components are wired identically in-process (tests) and across
//! processes (deployments).
//!
//! Control calls retry `Transient` failures with a bounded budget. The data
//! plane never goes through this module.

mod client;
mod messages;
mod server;

pub use client::RpcClient;
pub use messages::*;
pub use server::{RpcServer, ServiceDispatcher};

use async_trait::async_trait;

use crate::Result;
use crate::model::TfId;

/// Scheduler-side control surface, served to senders, builders and external
/// controllers.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<()>;

    async fn get_partition_state(&self) -> Result<PartitionStateReply>;

    async fn num_stf_senders(&self) -> Result<u32>;

    async fn stf_announce(&self, announce: StfAnnounce) -> Result<StfAnnounceStatus>;

    /// `None` while the scheduler has not finished instructing every sender
    /// for this TF.
    async fn number_of_stfs(&self, tf_id: TfId) -> Result<Option<u32>>;

    async fn terminate_partition(&self, req: TerminatePartition) -> Result<PartitionStateReply>;

    /// Builder's completion ack; finalizes the TF record and releases the
    /// scheduler's view of the reservation.
    async fn tf_built(&self, built: TfBuilt) -> Result<()>;

    /// Full builder (re-)registration; the scheduler connects every sender
    /// to the builder's data plane before admitting it into the pool.
    async fn register_builder(&self, req: RegisterBuilder) -> Result<RegisterBuilderReply>;
}

/// Sender-side control surface, served to the scheduler.
#[async_trait]
pub trait SenderApi: Send + Sync {
    async fn fetch_request(&self, fetch: FetchRequest) -> Result<FetchRequestStatus>;

    async fn connect_builder(&self, connect: ConnectBuilder) -> Result<ConnectBuilderReply>;

    async fn disconnect_builder(&self, disconnect: DisconnectBuilder)
    -> Result<DisconnectBuilderReply>;

    async fn terminate(&self, req: TerminatePartition) -> Result<()>;
}

/// Builder-side control surface, served to the scheduler.
#[async_trait]
pub trait BuilderApi: Send + Sync {
    async fn build_instruction(&self, instruction: BuildInstruction)
    -> Result<BuildInstructionStatus>;

    /// Idempotent: dropping an unknown or already-dropped TF is a no-op.
    async fn drop_tf(&self, tf_id: TfId) -> Result<()>;

    async fn terminate(&self, req: TerminatePartition) -> Result<()>;
}

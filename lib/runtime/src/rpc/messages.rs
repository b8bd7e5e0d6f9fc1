// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane message types.
//!
//! Requests are dispatched by method name; bodies are JSON. The wire
//! encoding is implementation-defined but stable per deployment.

use serde::{Deserialize, Serialize};

use crate::model::{BuilderId, SenderId, StfOrigin, TfId};
use crate::transport::RemoteRegion;
use crate::{PartitionState, ProcessRole};

/// All control RPCs, tagged by method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum Request {
    /// Reachability probe, answered by every role.
    Ping,
    Heartbeat(Heartbeat),
    GetPartitionState,
    NumStfSenders,
    StfAnnounce(StfAnnounce),
    BuildInstruction(BuildInstruction),
    FetchRequest(FetchRequest),
    NumberOfStfs { tf_id: TfId },
    DropTf { tf_id: TfId },
    TerminatePartition(TerminatePartition),
    RegisterBuilder(RegisterBuilder),
    ConnectBuilder(ConnectBuilder),
    DisconnectBuilder(DisconnectBuilder),
    TfBuilt(TfBuilt),
}

/// Envelope for replies: either a method-specific body or an error string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Response {
    Ok(serde_json::Value),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub process_id: String,
    pub role: ProcessRole,
    pub ts_ms: u64,
    /// Builders attach their capacity numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<BuilderCapacityInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderCapacityInfo {
    pub total_bytes: u64,
    pub reserved_bytes: u64,
    pub free_bytes: u64,
    pub in_flight_tfs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionStateReply {
    pub state: PartitionState,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StfAnnounce {
    pub sender_id: SenderId,
    pub tf_id: TfId,
    pub size_bytes: u64,
    pub origin: StfOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StfAnnounceStatus {
    /// Accepted; keep the fragment until fetched or dropped.
    Ok,
    /// Scheduler is running but refuses this TF; free it now.
    DropRunning,
    /// Scheduler is not accepting updates; free it now.
    DropNotRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInstruction {
    pub tf_id: TfId,
    pub total_bytes: u64,
    pub sender_ids: Vec<SenderId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildInstructionStatus {
    Ok,
    ErrorCapacity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub tf_id: TfId,
    /// `"-1"` is the drop sentinel: free without fetching.
    pub builder_id: BuilderId,
}

impl FetchRequest {
    pub fn is_drop(&self) -> bool {
        self.builder_id == crate::model::BUILDER_ID_DROP
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchRequestStatus {
    Ok,
    /// The TF aged out of the buffer before the request arrived.
    DroppedTimeout,
    /// The TF is not (or no longer) known to this sender.
    DroppedUnknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberOfStfsReply {
    /// `None` while the scheduler has not finished instructing the senders.
    pub n: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatePartition {
    pub partition_id: String,
}

/// Builder -> scheduler: full (re-)registration. The scheduler orchestrates
/// the data-plane connection from every sender before admitting the builder
/// into the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBuilder {
    pub builder_id: BuilderId,
    pub rpc_endpoint: String,
    pub data_endpoint: String,
    pub capacity: BuilderCapacityInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBuilderReply {
    pub status: ConnectStatus,
    /// Senders that accepted the data-plane connection.
    pub connected_senders: Vec<SenderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectBuilder {
    pub builder_id: BuilderId,
    /// The builder's data-plane listener, `host:port`.
    pub data_endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Ok,
    ErrorTransport,
    ErrorAlreadyConnected,
    /// Not every sender of the partition is reachable yet.
    ErrorSendersNotReady,
    ErrorTerminating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectBuilderReply {
    pub status: ConnectStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectBuilder {
    pub builder_id: BuilderId,
}

/// Aggregates every per-peer failure instead of keeping only the last one.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DisconnectBuilderReply {
    pub errors: Vec<String>,
}

impl DisconnectBuilderReply {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfBuilt {
    pub builder_id: BuilderId,
    pub tf_id: TfId,
    pub size_bytes: u64,
}

/// Published under the partition's discovery prefix by every process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEndpoints {
    pub process_id: String,
    pub role: ProcessRole,
    pub rpc_endpoint: String,
    /// Builders: where senders dial the data plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_endpoint: Option<String>,
    /// Senders: regions a builder may read, published at connect time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<RemoteRegion>,
}

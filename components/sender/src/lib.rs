// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! STF sender.
//!
//! Buffers SubTimeFrame fragments arriving from the readout source, announces
//! them to the scheduler, and serves fetches from TimeFrame builders over the
//! data plane. Fragments are released only after the owning builder's
//! completion ack or an explicit drop command.

pub mod egress;
pub mod ingress;
pub mod rpc;
pub mod service;
pub mod store;

pub use service::{SenderHandle, SenderService};
pub use store::SenderStfStore;

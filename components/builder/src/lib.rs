// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TimeFrame builder.
//!
//! Admits TimeFrames against local buffer capacity, fetches every sender's
//! fragment over the data plane, merges them in ascending `tf_id` order and
//! hands the assembled TimeFrame downstream. Admission is the only point of
//! refusal; past it, failures drop the TF rather than block the pipeline.

pub mod capacity;
pub mod fetch;
pub mod input;
pub mod rpc;
pub mod service;

pub use capacity::BuilderCapacity;
pub use input::InputPipeline;
pub use service::{BuilderHandle, BuilderService};

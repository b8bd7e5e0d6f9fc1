// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Builder-side control surface.
//!
//! Admission is the only point where the builder refuses work: a
//! `BuildInstruction` that does not fit the free capacity is answered with
//! `error_capacity` and the scheduler drops the TF elsewhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::Result;
use tfdist_runtime::model::TfId;
use tfdist_runtime::rpc::{
    BuildInstruction, BuildInstructionStatus, BuilderApi, TerminatePartition,
};

use crate::capacity::BuilderCapacity;
use crate::input::InputPipeline;

pub struct BuilderRpc {
    capacity: Arc<BuilderCapacity>,
    pipeline: Arc<InputPipeline>,
    accepting: AtomicBool,
    drain_grace: Duration,
    cancel: CancellationToken,
}

impl BuilderRpc {
    pub fn new(
        capacity: Arc<BuilderCapacity>,
        pipeline: Arc<InputPipeline>,
        drain_grace: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            pipeline,
            accepting: AtomicBool::new(true),
            drain_grace,
            cancel,
        })
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}

#[async_trait]
impl BuilderApi for BuilderRpc {
    async fn build_instruction(
        &self,
        instruction: BuildInstruction,
    ) -> Result<BuildInstructionStatus> {
        if !self.accepting() {
            return Ok(BuildInstructionStatus::ErrorCapacity);
        }

        if !self.capacity.reserve(instruction.tf_id, instruction.total_bytes) {
            tracing::info!(
                tf_id = instruction.tf_id,
                total_bytes = instruction.total_bytes,
                free = self.capacity.free_bytes(),
                "admission refused"
            );
            return Ok(BuildInstructionStatus::ErrorCapacity);
        }

        self.pipeline.admit(instruction.tf_id).await;
        tracing::debug!(
            tf_id = instruction.tf_id,
            total_bytes = instruction.total_bytes,
            senders = instruction.sender_ids.len(),
            "TF admitted"
        );
        Ok(BuildInstructionStatus::Ok)
    }

    async fn drop_tf(&self, tf_id: TfId) -> Result<()> {
        self.pipeline.abort(tf_id).await;
        Ok(())
    }

    async fn terminate(&self, req: TerminatePartition) -> Result<()> {
        tracing::info!(partition_id = %req.partition_id, "terminate requested");
        self.stop_accepting();

        // bounded drain, then teardown
        let pipeline = self.pipeline.clone();
        let grace = self.drain_grace;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + grace;
            while pipeline.outstanding() > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let leftover = pipeline.outstanding();
            if leftover > 0 {
                tracing::warn!(leftover, "terminating with undrained TFs");
            }
            cancel.cancel();
        });
        Ok(())
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sender-side control surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::Result;
use tfdist_runtime::rpc::{
    ConnectBuilder, ConnectBuilderReply, ConnectStatus, DisconnectBuilder,
    DisconnectBuilderReply, FetchRequest, FetchRequestStatus, SenderApi, TerminatePartition,
};

use crate::egress::{EgressEngine, FetchOrder};
use crate::store::{DropReason, FetchOutcome, SenderStfStore};

pub struct SenderRpc {
    store: Arc<SenderStfStore>,
    egress: Arc<EgressEngine>,
    accepting: AtomicBool,
    cancel: CancellationToken,
}

impl SenderRpc {
    pub fn new(
        store: Arc<SenderStfStore>,
        egress: Arc<EgressEngine>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            egress,
            accepting: AtomicBool::new(true),
            cancel,
        })
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SenderApi for SenderRpc {
    async fn fetch_request(&self, fetch: FetchRequest) -> Result<FetchRequestStatus> {
        // drop sentinel: free immediately, no fetch
        if fetch.is_drop() {
            return Ok(if self.store.drop_tf(fetch.tf_id, DropReason::SchedulerCommand) {
                FetchRequestStatus::Ok
            } else {
                FetchRequestStatus::DroppedUnknown
            });
        }

        if !self.accepting() {
            self.store.drop_tf(fetch.tf_id, DropReason::SchedulerCommand);
            return Ok(FetchRequestStatus::DroppedUnknown);
        }

        match self.store.begin_fetch(fetch.tf_id, &fetch.builder_id) {
            FetchOutcome::Serve(fragment) => {
                let order = FetchOrder {
                    tf_id: fetch.tf_id,
                    fragment,
                };
                if let Err(failed) = self.egress.enqueue(&fetch.builder_id, order).await {
                    tracing::error!(
                        tf_id = failed.tf_id,
                        builder_id = %fetch.builder_id,
                        "no egress link for builder; dropping TF"
                    );
                    self.store.drop_tf(failed.tf_id, DropReason::EgressFailure);
                    return Ok(FetchRequestStatus::DroppedUnknown);
                }
                Ok(FetchRequestStatus::Ok)
            }
            FetchOutcome::DroppedTimeout => Ok(FetchRequestStatus::DroppedTimeout),
            FetchOutcome::Unknown => Ok(FetchRequestStatus::DroppedUnknown),
        }
    }

    async fn connect_builder(&self, connect: ConnectBuilder) -> Result<ConnectBuilderReply> {
        if !self.accepting() {
            return Ok(ConnectBuilderReply {
                status: ConnectStatus::ErrorTransport,
            });
        }
        let status = self
            .egress
            .connect_builder(&connect.builder_id, &connect.data_endpoint)
            .await;
        Ok(ConnectBuilderReply { status })
    }

    async fn disconnect_builder(
        &self,
        disconnect: DisconnectBuilder,
    ) -> Result<DisconnectBuilderReply> {
        let mut reply = DisconnectBuilderReply::default();
        if !self.egress.disconnect_builder(&disconnect.builder_id) {
            reply
                .errors
                .push(format!("unknown builder {}", disconnect.builder_id));
        }
        Ok(reply)
    }

    async fn terminate(&self, req: TerminatePartition) -> Result<()> {
        tracing::info!(partition_id = %req.partition_id, "terminate requested");
        self.accepting.store(false, Ordering::Release);

        let dropped = self.store.drop_all(DropReason::SchedulerCommand);
        if dropped > 0 {
            tracing::info!(dropped, "dropped buffered TFs on terminate");
        }
        for builder_id in self.egress.connected_builders() {
            self.egress.disconnect_builder(&builder_id);
        }
        self.cancel.cancel();
        Ok(())
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Readout intake.
//!
//! Consumes fragments from the readout source channel, buffers them and
//! announces each `(tf_id, size)` to the scheduler. Announcements are issued
//! strictly in `tf_id` order; a reordered fragment from the source is a bug
//! upstream and is dropped here.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::model::{SenderId, StfFragment, TfId};
use tfdist_runtime::rpc::{SchedulerApi, StfAnnounce, StfAnnounceStatus};

use crate::store::{DropReason, SenderStfStore};

pub struct Ingress {
    sender_id: SenderId,
    store: Arc<SenderStfStore>,
    scheduler: Arc<dyn SchedulerApi>,
    cancel: CancellationToken,
}

impl Ingress {
    pub fn new(
        sender_id: SenderId,
        store: Arc<SenderStfStore>,
        scheduler: Arc<dyn SchedulerApi>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sender_id,
            store,
            scheduler,
            cancel,
        }
    }

    /// Intake loop; one per sender process.
    pub async fn run(self, mut source: mpsc::Receiver<StfFragment>) {
        let mut last_announced: Option<TfId> = None;

        loop {
            let fragment = tokio::select! {
                fragment = source.recv() => match fragment {
                    Some(fragment) => fragment,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            let tf_id = fragment.header.tf_id;

            if let Some(last) = last_announced {
                if tf_id <= last {
                    tracing::error!(
                        tf_id,
                        last_announced = last,
                        "readout produced a non-monotonic tf id; dropping fragment"
                    );
                    continue;
                }
            }

            let origin = fragment.header.origin;
            let size_bytes = match self.store.insert(fragment) {
                Ok(stored) => stored.size_bytes(),
                Err(err) => {
                    tracing::error!(tf_id, error = %err, "cannot buffer fragment; dropping");
                    continue;
                }
            };

            last_announced = Some(tf_id);

            let announce = StfAnnounce {
                sender_id: self.sender_id.clone(),
                tf_id,
                size_bytes,
                origin,
            };
            match self.scheduler.stf_announce(announce).await {
                Ok(StfAnnounceStatus::Ok) => {
                    tracing::trace!(tf_id, size_bytes, "announced");
                }
                Ok(StfAnnounceStatus::DropRunning) => {
                    tracing::warn!(tf_id, "scheduler refused the TF; dropping");
                    self.store.drop_tf(tf_id, DropReason::SchedulerCommand);
                }
                Ok(StfAnnounceStatus::DropNotRunning) => {
                    tracing::info!(tf_id, "scheduler not accepting; dropping");
                    self.store.drop_tf(tf_id, DropReason::SchedulerCommand);
                }
                Err(err) => {
                    tracing::error!(tf_id, error = %err, "announce failed; dropping");
                    self.store.drop_tf(tf_id, DropReason::EgressFailure);
                }
            }
        }

        tracing::debug!("ingress exiting");
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sender connection manager.
//!
//! Holds one RPC client per sender. Fetch requests go through a per-sender
//! FIFO queue drained by one worker, so every sender observes them in
//! strictly increasing `tf_id` order. Drops fan out asynchronously; their
//! completions are logged by the drop-wait task without blocking the state
//! machine. A monitor task pings every sender and drives the partition
//! health the instance reports.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::model::{BUILDER_ID_DROP, BuilderId, SenderId, TfId};
use tfdist_runtime::rpc::{
    ConnectBuilder, DisconnectBuilder, DisconnectBuilderReply, FetchRequest, FetchRequestStatus,
    RpcClient, SenderApi, TerminatePartition,
};

/// Aggregate reachability of the sender set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSetState {
    Initializing,
    Ok,
    Incomplete,
}

const SENDER_STATE_INITIALIZING: u8 = 0;
const SENDER_STATE_OK: u8 = 1;
const SENDER_STATE_INCOMPLETE: u8 = 2;

/// One fetch to be issued to one sender.
pub struct FetchJob {
    pub tf_id: TfId,
    pub builder_id: BuilderId,
}

/// A fetch that came back without `Ok`; the owning TF must be dropped.
pub struct FetchFailure {
    pub tf_id: TfId,
    pub sender_id: SenderId,
    pub status: Option<FetchRequestStatus>,
}

struct SenderConn {
    client: Arc<RpcClient>,
    fetch_tx: mpsc::Sender<FetchJob>,
}

pub struct ConnManager {
    partition_id: String,
    senders: Mutex<HashMap<SenderId, SenderConn>>,
    sender_state: Arc<AtomicU8>,
    drop_done_tx: mpsc::UnboundedSender<TfId>,
    failure_tx: mpsc::UnboundedSender<FetchFailure>,
    cancel: CancellationToken,
}

/// Per-sender fetch queue depth.
const FETCH_QUEUE_DEPTH: usize = 256;

impl ConnManager {
    /// Build the manager from the resolved sender set and start the
    /// per-sender workers, the drop-wait task and the monitor.
    pub fn start(
        partition_id: String,
        sender_endpoints: Vec<(SenderId, String)>,
        max_frame_size: usize,
        retry_attempts: u32,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FetchFailure>) {
        let (drop_done_tx, drop_done_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let mut senders = HashMap::new();
        for (sender_id, endpoint) in sender_endpoints {
            let client = Arc::new(
                RpcClient::new(endpoint, max_frame_size).with_retry_attempts(retry_attempts),
            );
            let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_QUEUE_DEPTH);

            tokio::spawn(fetch_worker(
                sender_id.clone(),
                client.clone(),
                fetch_rx,
                failure_tx.clone(),
                cancel.clone(),
            ));

            senders.insert(sender_id, SenderConn { client, fetch_tx });
        }

        let manager = Arc::new(Self {
            partition_id,
            senders: Mutex::new(senders),
            sender_state: Arc::new(AtomicU8::new(SENDER_STATE_INITIALIZING)),
            drop_done_tx,
            failure_tx,
            cancel: cancel.clone(),
        });

        tokio::spawn(drop_wait_task(drop_done_rx, cancel.clone()));
        tokio::spawn(monitor_task(manager.clone(), cancel));

        (manager, failure_rx)
    }

    pub fn sender_ids(&self) -> Vec<SenderId> {
        self.senders.lock().keys().cloned().collect()
    }

    pub fn sender_count(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn sender_state(&self) -> SenderSetState {
        match self.sender_state.load(Ordering::Acquire) {
            SENDER_STATE_OK => SenderSetState::Ok,
            SENDER_STATE_INCOMPLETE => SenderSetState::Incomplete,
            _ => SenderSetState::Initializing,
        }
    }

    /// Queue a fetch on the sender's FIFO.
    pub async fn enqueue_fetch(&self, sender_id: &SenderId, job: FetchJob) {
        let fetch_tx = match self.senders.lock().get(sender_id) {
            Some(conn) => conn.fetch_tx.clone(),
            None => {
                tracing::error!(sender_id = %sender_id, "fetch for unknown sender");
                let _ = self.failure_tx.send(FetchFailure {
                    tf_id: job.tf_id,
                    sender_id: sender_id.clone(),
                    status: None,
                });
                return;
            }
        };

        let tf_id = job.tf_id;
        if fetch_tx.send(job).await.is_err() {
            tracing::error!(sender_id = %sender_id, tf_id, "fetch queue closed");
        }
    }

    /// Asynchronously command every named sender to drop a TF
    /// (`builder_id = "-1"`). Completion is logged by the drop-wait task.
    pub fn drop_stfs_async(&self, tf_id: TfId, sender_ids: Vec<SenderId>) {
        let clients: Vec<(SenderId, Arc<RpcClient>)> = {
            let senders = self.senders.lock();
            sender_ids
                .into_iter()
                .filter_map(|id| senders.get(&id).map(|c| (id, c.client.clone())))
                .collect()
        };
        let drop_done_tx = self.drop_done_tx.clone();

        tokio::spawn(async move {
            for (sender_id, client) in clients {
                let request = FetchRequest {
                    tf_id,
                    builder_id: BUILDER_ID_DROP.to_string(),
                };
                match client.fetch_request(request).await {
                    Ok(FetchRequestStatus::Ok) => {}
                    Ok(FetchRequestStatus::DroppedTimeout) => {
                        tracing::warn!(
                            sender_id = %sender_id,
                            tf_id,
                            "sender dropped the STF before the scheduler's command"
                        );
                    }
                    Ok(FetchRequestStatus::DroppedUnknown) => {
                        tracing::warn!(
                            sender_id = %sender_id,
                            tf_id,
                            "sender dropped the STF for an unknown reason"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(sender_id = %sender_id, tf_id, error = %err, "drop command failed");
                    }
                }
            }
            let _ = drop_done_tx.send(tf_id);
        });
    }

    /// Instruct every sender to open a data connection to the builder.
    /// On the first failure all senders are disconnected again.
    pub async fn connect_builder_everywhere(
        &self,
        builder_id: &BuilderId,
        data_endpoint: &str,
    ) -> Result<Vec<SenderId>, String> {
        let clients: Vec<(SenderId, Arc<RpcClient>)> = {
            let senders = self.senders.lock();
            senders
                .iter()
                .map(|(id, conn)| (id.clone(), conn.client.clone()))
                .collect()
        };

        let mut connected = Vec::with_capacity(clients.len());
        for (sender_id, client) in &clients {
            let request = ConnectBuilder {
                builder_id: builder_id.clone(),
                data_endpoint: data_endpoint.to_string(),
            };
            let failed = match client.connect_builder(request).await {
                Ok(reply) if reply.status == tfdist_runtime::rpc::ConnectStatus::Ok => {
                    connected.push(sender_id.clone());
                    None
                }
                Ok(reply) => Some(format!("{:?}", reply.status)),
                Err(err) => Some(err.to_string()),
            };

            if let Some(reason) = failed {
                tracing::error!(
                    sender_id = %sender_id,
                    builder_id = %builder_id,
                    reason = %reason,
                    "builder connect failed; rolling back"
                );
                let reply = self.disconnect_builder_everywhere(builder_id).await;
                if !reply.is_ok() {
                    tracing::warn!(
                        builder_id = %builder_id,
                        errors = ?reply.errors,
                        "rollback disconnects reported errors"
                    );
                }
                return Err(format!("sender {sender_id}: {reason}"));
            }
        }
        Ok(connected)
    }

    /// Disconnect the builder from every sender, aggregating all per-peer
    /// errors into the reply.
    pub async fn disconnect_builder_everywhere(
        &self,
        builder_id: &BuilderId,
    ) -> DisconnectBuilderReply {
        let clients: Vec<(SenderId, Arc<RpcClient>)> = {
            let senders = self.senders.lock();
            senders
                .iter()
                .map(|(id, conn)| (id.clone(), conn.client.clone()))
                .collect()
        };

        let mut reply = DisconnectBuilderReply::default();
        for (sender_id, client) in clients {
            let request = DisconnectBuilder {
                builder_id: builder_id.clone(),
            };
            match client.disconnect_builder(request).await {
                Ok(peer_reply) => {
                    for error in peer_reply.errors {
                        reply.errors.push(format!("{sender_id}: {error}"));
                    }
                }
                Err(err) => {
                    reply.errors.push(format!("{sender_id}: {err}"));
                }
            }
        }
        reply
    }

    /// Terminate fan-out; returns true when every sender answered.
    pub async fn request_senders_terminate(&self) -> bool {
        let clients: Vec<(SenderId, Arc<RpcClient>)> = {
            let senders = self.senders.lock();
            senders
                .iter()
                .map(|(id, conn)| (id.clone(), conn.client.clone()))
                .collect()
        };

        let mut all_ok = true;
        for (sender_id, client) in clients {
            let request = TerminatePartition {
                partition_id: self.partition_id.clone(),
            };
            if let Err(err) = SenderApi::terminate(client.as_ref(), request).await {
                tracing::warn!(sender_id = %sender_id, error = %err, "sender terminate failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

/// Drains one sender's FIFO; fetches reach the sender in queue order.
async fn fetch_worker(
    sender_id: SenderId,
    client: Arc<RpcClient>,
    mut queue: mpsc::Receiver<FetchJob>,
    failure_tx: mpsc::UnboundedSender<FetchFailure>,
    cancel: CancellationToken,
) {
    tracing::debug!(sender_id = %sender_id, "fetch worker started");
    loop {
        let job = tokio::select! {
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let request = FetchRequest {
            tf_id: job.tf_id,
            builder_id: job.builder_id.clone(),
        };
        match client.fetch_request(request).await {
            Ok(FetchRequestStatus::Ok) => {
                tracing::trace!(sender_id = %sender_id, tf_id = job.tf_id, "fetch issued");
            }
            Ok(status) => {
                let _ = failure_tx.send(FetchFailure {
                    tf_id: job.tf_id,
                    sender_id: sender_id.clone(),
                    status: Some(status),
                });
            }
            Err(err) => {
                tracing::warn!(sender_id = %sender_id, tf_id = job.tf_id, error = %err, "fetch request failed");
                let _ = failure_tx.send(FetchFailure {
                    tf_id: job.tf_id,
                    sender_id: sender_id.clone(),
                    status: None,
                });
            }
        }
    }
    tracing::debug!(sender_id = %sender_id, "fetch worker exiting");
}

/// Logs completed asynchronous drops in id order without blocking anything.
async fn drop_wait_task(mut rx: mpsc::UnboundedReceiver<TfId>, cancel: CancellationToken) {
    let mut dropped_total: u64 = 0;
    let mut batch = Vec::new();

    loop {
        let first = tokio::select! {
            id = rx.recv() => match id {
                Some(id) => id,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        batch.push(first);
        while let Ok(id) = rx.try_recv() {
            batch.push(id);
        }
        batch.sort_unstable();
        for tf_id in batch.drain(..) {
            dropped_total += 1;
            tracing::debug!(tf_id, total = dropped_total, "drop fan-out finished");
        }
    }
    tracing::debug!("drop-wait task exiting");
}

/// Pings every sender once a second and aggregates reachability.
async fn monitor_task(manager: Arc<ConnManager>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(1000));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let clients: Vec<(SenderId, Arc<RpcClient>)> = {
            let senders = manager.senders.lock();
            senders
                .iter()
                .map(|(id, conn)| (id.clone(), conn.client.clone()))
                .collect()
        };
        let total = clients.len();

        let mut ready = 0usize;
        for (sender_id, client) in clients {
            match client.ping().await {
                Ok(()) => ready += 1,
                Err(err) => {
                    tracing::debug!(sender_id = %sender_id, error = %err, "sender unreachable");
                }
            }
        }

        let state = if ready == total {
            SENDER_STATE_OK
        } else {
            tracing::warn!(ready, total, "waiting for senders");
            SENDER_STATE_INCOMPLETE
        };
        manager.sender_state.store(state, Ordering::Release);
    }
    tracing::debug!("sender monitor exiting");
}

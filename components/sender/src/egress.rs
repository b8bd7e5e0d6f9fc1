// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Egress engine.
//!
//! One data-plane link per connected builder, each with a bounded FIFO
//! queue drained by one worker task: strict per-builder FIFO bounds the
//! number of fragments pinned per peer. The worker pushes the TF metadata
//! header (plus inline payloads on the copy fallback) and waits for the
//! builder's DONE ack before releasing the fragment to the dealloc task.
//!
//! A fragment crosses the wire at most once; any egress failure drops the
//! owning TF.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::codec::{PartDescriptor, TfDone, TfFetchStatus, TfMetaHeader, tag};
use tfdist_runtime::config::DataPlaneMode;
use tfdist_runtime::model::{BuilderId, SenderId, TfId};
use tfdist_runtime::region::RegionRegistry;
use tfdist_runtime::rpc::ConnectStatus;
use tfdist_runtime::transport::{Connection, RegionServer, RemoteRegion, connect_tcp};

use crate::store::{DropReason, SenderStfStore, StoredFragment};

/// Per-builder queue depth; bounds pinned fragments per peer.
const EGRESS_QUEUE_DEPTH: usize = 16;

/// One unit of egress work.
pub struct FetchOrder {
    pub tf_id: TfId,
    pub fragment: StoredFragment,
}

struct BuilderLink {
    conn: Arc<Connection>,
    queue: mpsc::Sender<FetchOrder>,
}

pub struct EgressEngine {
    sender_id: SenderId,
    mode: DataPlaneMode,
    max_frame_size: usize,
    ack_timeout: Duration,
    store: Arc<SenderStfStore>,
    registry: Arc<RegionRegistry>,
    links: Mutex<HashMap<BuilderId, BuilderLink>>,
    dealloc_tx: mpsc::UnboundedSender<TfId>,
    cancel: CancellationToken,
}

impl EgressEngine {
    pub fn new(
        sender_id: SenderId,
        mode: DataPlaneMode,
        max_frame_size: usize,
        ack_timeout: Duration,
        store: Arc<SenderStfStore>,
        registry: Arc<RegionRegistry>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (dealloc_tx, dealloc_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            sender_id,
            mode,
            max_frame_size,
            ack_timeout,
            store: store.clone(),
            registry,
            links: Mutex::new(HashMap::new()),
            dealloc_tx,
            cancel: cancel.clone(),
        });

        tokio::spawn(Self::dealloc_task(store, dealloc_rx, cancel));
        engine
    }

    /// Sent-fragment release runs off the egress hot path.
    async fn dealloc_task(
        store: Arc<SenderStfStore>,
        mut rx: mpsc::UnboundedReceiver<TfId>,
        cancel: CancellationToken,
    ) {
        let mut released: u64 = 0;
        loop {
            let tf_id = tokio::select! {
                tf_id = rx.recv() => match tf_id {
                    Some(tf_id) => tf_id,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            store.complete_sent(tf_id);
            released += 1;
            tracing::debug!(tf_id, total = released, "fragment released after ack");
        }
        tracing::debug!("dealloc task exiting");
    }

    /// Dial the builder's data listener and start its egress worker.
    /// Idempotent for an already-connected builder.
    pub async fn connect_builder(
        self: &Arc<Self>,
        builder_id: &BuilderId,
        data_endpoint: &str,
    ) -> ConnectStatus {
        if self.links.lock().contains_key(builder_id) {
            return ConnectStatus::Ok;
        }

        let conn = match connect_tcp(
            data_endpoint,
            builder_id.clone(),
            self.max_frame_size,
            self.cancel.clone(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(
                    builder_id = %builder_id,
                    endpoint = data_endpoint,
                    error = %err,
                    "builder data connection failed"
                );
                return ConnectStatus::ErrorTransport;
            }
        };

        // identification handshake, then our readable regions
        let regions: Vec<RemoteRegion> = self
            .registry
            .region_list()
            .iter()
            .map(|r| RemoteRegion {
                base: r.base(),
                size: r.size(),
                key: r.remote_key(),
            })
            .collect();
        let handshake = async {
            conn.send_string(&self.sender_id).await?;
            let encoded = serde_json::to_string(&regions)
                .map_err(|e| tfdist_runtime::TransportError::Fatal(e.to_string()))?;
            conn.send_string(&encoded).await
        };
        if let Err(err) = handshake.await {
            tracing::error!(builder_id = %builder_id, error = %err, "builder handshake failed");
            return ConnectStatus::ErrorTransport;
        }

        if self.mode == DataPlaneMode::Rma {
            let server = RegionServer::new(self.registry.clone());
            let server_conn = conn.clone();
            let server_cancel = self.cancel.child_token();
            tokio::spawn(async move { server.serve(server_conn, server_cancel).await });
        }

        let (queue_tx, queue_rx) = mpsc::channel(EGRESS_QUEUE_DEPTH);
        self.links.lock().insert(
            builder_id.clone(),
            BuilderLink {
                conn: conn.clone(),
                queue: queue_tx,
            },
        );

        let worker_engine = Arc::downgrade(self);
        let worker_builder = builder_id.clone();
        tokio::spawn(Self::egress_worker(
            worker_engine,
            worker_builder,
            conn,
            queue_rx,
        ));

        tracing::info!(builder_id = %builder_id, endpoint = data_endpoint, "builder connected");
        ConnectStatus::Ok
    }

    /// Tear down the builder's link. Queued, unserved orders drop their TFs.
    pub fn disconnect_builder(&self, builder_id: &BuilderId) -> bool {
        let Some(link) = self.links.lock().remove(builder_id) else {
            return false;
        };
        link.conn.close();
        tracing::info!(builder_id = %builder_id, "builder disconnected");
        true
    }

    pub fn connected_builders(&self) -> Vec<BuilderId> {
        self.links.lock().keys().cloned().collect()
    }

    /// Enqueue one fetch for the builder; FIFO per builder.
    pub async fn enqueue(&self, builder_id: &BuilderId, order: FetchOrder) -> Result<(), FetchOrder> {
        let queue = match self.links.lock().get(builder_id) {
            Some(link) => link.queue.clone(),
            None => return Err(order),
        };
        queue.send(order).await.map_err(|failed| failed.0)
    }

    async fn egress_worker(
        engine: Weak<EgressEngine>,
        builder_id: BuilderId,
        conn: Arc<Connection>,
        mut queue: mpsc::Receiver<FetchOrder>,
    ) {
        tracing::debug!(builder_id = %builder_id, "egress worker started");

        while let Some(order) = queue.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };

            if engine.cancel.is_cancelled() {
                engine.store.drop_tf(order.tf_id, DropReason::EgressFailure);
                continue;
            }

            match engine.serve_order(&conn, &order).await {
                Ok(()) => {
                    let _ = engine.dealloc_tx.send(order.tf_id);
                }
                Err(ServeError::TfFailed(message)) => {
                    tracing::error!(
                        builder_id = %builder_id,
                        tf_id = order.tf_id,
                        error = %message,
                        "egress failed; dropping TF"
                    );
                    engine.store.drop_tf(order.tf_id, DropReason::EgressFailure);
                }
                Err(ServeError::PeerGone(message)) => {
                    tracing::error!(
                        builder_id = %builder_id,
                        tf_id = order.tf_id,
                        error = %message,
                        "builder connection lost; disconnecting"
                    );
                    engine.store.drop_tf(order.tf_id, DropReason::EgressFailure);
                    engine.disconnect_builder(&builder_id);
                    break;
                }
            }
        }

        // orders that never reached the wire drop their TFs
        while let Ok(order) = queue.try_recv() {
            if let Some(engine) = engine.upgrade() {
                engine.store.drop_tf(order.tf_id, DropReason::EgressFailure);
            }
        }
        tracing::debug!(builder_id = %builder_id, "egress worker exiting");
    }

    async fn serve_order(&self, conn: &Connection, order: &FetchOrder) -> Result<(), ServeError> {
        let meta = TfMetaHeader {
            tf_id: order.tf_id,
            total_bytes: order.fragment.size_bytes(),
            parts: order
                .fragment
                .parts
                .iter()
                .map(|part| {
                    Ok(PartDescriptor {
                        remote_addr: part.addr,
                        length: part.len,
                        header: Bytes::from(
                            serde_json::to_vec(&part.header)
                                .map_err(|e| ServeError::TfFailed(e.to_string()))?,
                        ),
                    })
                })
                .collect::<Result<Vec<_>, ServeError>>()?,
        };

        conn.send_tagged(tag::META, meta.encode())
            .await
            .map_err(ServeError::from)?;

        if self.mode == DataPlaneMode::Copy {
            for part in &order.fragment.parts {
                let payload = if part.len == 0 {
                    Bytes::new()
                } else {
                    self.store
                        .arena()
                        .region()
                        .read(part.addr, part.len)
                        .map_err(|e| ServeError::TfFailed(e.to_string()))?
                };
                conn.send_tagged(tag::DATA, payload)
                    .await
                    .map_err(ServeError::from)?;
            }
        }

        let done = tokio::time::timeout(self.ack_timeout, conn.recv_tagged(tag::DONE))
            .await
            .map_err(|_| ServeError::TfFailed("timed out waiting for builder ack".to_string()))?
            .map_err(ServeError::from)?;

        let done = TfDone::decode(done).map_err(|e| ServeError::TfFailed(e.to_string()))?;
        if done.tf_id != order.tf_id {
            return Err(ServeError::PeerGone(format!(
                "ack for tf {} while serving tf {}",
                done.tf_id, order.tf_id
            )));
        }
        if done.status != TfFetchStatus::Ok {
            return Err(ServeError::TfFailed(format!(
                "builder reported fetch failure for tf {}",
                done.tf_id
            )));
        }
        Ok(())
    }
}

enum ServeError {
    /// Drop the TF, keep the peer.
    TfFailed(String),
    /// Drop the TF and the peer.
    PeerGone(String),
}

impl From<tfdist_runtime::TransportError> for ServeError {
    fn from(err: tfdist_runtime::TransportError) -> Self {
        match err {
            tfdist_runtime::TransportError::PeerGone(m) => ServeError::PeerGone(m),
            other => ServeError::TfFailed(other.to_string()),
        }
    }
}

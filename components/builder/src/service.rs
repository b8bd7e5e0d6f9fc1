// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Builder process assembly.
//!
//! Registers the destination region, opens the data-plane listener for
//! sender connections, starts the input pipeline, registers with the
//! scheduler (which orchestrates the sender-side connects) and heart-beats
//! its capacity.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::config::DataPlaneMode;
use tfdist_runtime::discovery::{KeyValueStore, await_scheduler, publish_endpoints, withdraw_endpoints};
use tfdist_runtime::model::{SenderId, TimeFrame, now_ms};
use tfdist_runtime::region::{RegionArena, RegionRegistry};
use tfdist_runtime::rpc::{
    ConnectStatus, Heartbeat, ProcessEndpoints, RegisterBuilder, RpcServer, SchedulerApi,
    ServiceDispatcher,
};
use tfdist_runtime::transport::{
    Connection, CopyDataPlane, DataListener, DataPlane, RemoteRegion, RmaDataPlane,
};
use tfdist_runtime::{ProcessRole, Result, RuntimeConfig, raise};

use crate::capacity::BuilderCapacity;
use crate::fetch::{SenderLink, fetch_loop};
use crate::input::InputPipeline;
use crate::rpc::BuilderRpc;

pub struct BuilderService;

pub struct BuilderHandle {
    pub builder_id: String,
    pub rpc_endpoint: String,
    pub data_endpoint: String,
    pub capacity: Arc<BuilderCapacity>,
    pub pipeline: Arc<InputPipeline>,
    partition_id: String,
    kv: Arc<dyn KeyValueStore>,
    cancel: CancellationToken,
}

impl BuilderService {
    pub async fn start(
        config: RuntimeConfig,
        kv: Arc<dyn KeyValueStore>,
        downstream: mpsc::Sender<TimeFrame>,
    ) -> Result<BuilderHandle> {
        config.validate()?;
        let builder_id = config.process_id.clone();
        if builder_id.is_empty() {
            raise!("builder requires a process_id");
        }

        let cancel = CancellationToken::new();

        // destination region for one-sided reads
        let registry = Arc::new(RegionRegistry::new());
        let region = registry
            .register(config.region_size)
            .map_err(|e| tfdist_runtime::error!("region registration failed: {e}"))?;
        let arena = Arc::new(RegionArena::new(region));

        let capacity = Arc::new(BuilderCapacity::new(config.builder_capacity));

        // control endpoint
        let server = RpcServer::bind(config.rpc_bind.as_str(), config.max_frame_size).await?;
        let rpc_endpoint = server.local_addr().to_string();

        // data-plane listener for sender connections
        let listener = DataListener::bind(config.data_bind.as_str(), config.max_frame_size)
            .await
            .map_err(|e| tfdist_runtime::error!("data listener bind failed: {e}"))?;
        let data_endpoint = listener.local_addr().to_string();

        // resolve the scheduler
        let scheduler: Arc<dyn SchedulerApi> =
            Arc::new(await_scheduler(kv.as_ref(), &config).await?);

        let pipeline = InputPipeline::start(
            builder_id.clone(),
            capacity.clone(),
            scheduler.clone(),
            downstream,
            config.keep_first_empty_part,
            cancel.clone(),
        );

        let builder_rpc = BuilderRpc::new(
            capacity.clone(),
            pipeline.clone(),
            config.drain_grace(),
            cancel.clone(),
        );
        let dispatcher = ServiceDispatcher::new().with_builder(builder_rpc);
        tokio::spawn(server.serve(dispatcher, cancel.clone()));

        // accept sender data connections
        let links: Arc<DashMap<SenderId, Arc<SenderLink>>> = Arc::new(DashMap::new());
        tokio::spawn(accept_task(
            listener,
            links.clone(),
            pipeline.clone(),
            arena,
            config.data_plane,
            config.per_sender_fetch_concurrency,
            cancel.clone(),
        ));

        // make ourselves discoverable, then register with the scheduler
        let endpoints = ProcessEndpoints {
            process_id: builder_id.clone(),
            role: ProcessRole::TfBuilder,
            rpc_endpoint: rpc_endpoint.clone(),
            data_endpoint: Some(data_endpoint.clone()),
            regions: Vec::new(),
        };
        publish_endpoints(kv.as_ref(), &config.partition_id, &endpoints).await?;

        // the scheduler refuses registration until its sender set is
        // reachable; poll until then
        let deadline = tokio::time::Instant::now() + config.discovery_timeout();
        let reply = loop {
            let registration = RegisterBuilder {
                builder_id: builder_id.clone(),
                rpc_endpoint: rpc_endpoint.clone(),
                data_endpoint: data_endpoint.clone(),
                capacity: capacity.snapshot(),
            };
            let reply = scheduler.register_builder(registration).await?;
            match reply.status {
                ConnectStatus::ErrorSendersNotReady if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                _ => break reply,
            }
        };
        if reply.status != ConnectStatus::Ok {
            raise!("builder registration refused: {:?}", reply.status);
        }
        tracing::info!(
            builder_id = %builder_id,
            senders = reply.connected_senders.len(),
            "registered with scheduler"
        );

        // capacity heartbeats
        tokio::spawn(heartbeat_task(
            builder_id.clone(),
            capacity.clone(),
            scheduler,
            config.heartbeat_interval(),
            cancel.clone(),
        ));

        tracing::info!(
            builder_id = %builder_id,
            rpc_endpoint = %rpc_endpoint,
            data_endpoint = %data_endpoint,
            capacity = config.builder_capacity,
            "builder started"
        );

        Ok(BuilderHandle {
            builder_id,
            rpc_endpoint,
            data_endpoint,
            capacity,
            pipeline,
            partition_id: config.partition_id,
            kv,
            cancel,
        })
    }
}

/// Accepts sender connections, performs the identification handshake and
/// starts one fetch loop per sender.
async fn accept_task(
    listener: DataListener,
    links: Arc<DashMap<SenderId, Arc<SenderLink>>>,
    pipeline: Arc<InputPipeline>,
    arena: Arc<RegionArena>,
    mode: DataPlaneMode,
    per_sender_fetch_concurrency: usize,
    cancel: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            conn = listener.accept(cancel.clone()) => conn,
            _ = cancel.cancelled() => break,
        };

        let conn = match conn {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, "data accept failed");
                continue;
            }
        };

        let links = links.clone();
        let pipeline = pipeline.clone();
        let arena = arena.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match handshake(conn, arena, mode, per_sender_fetch_concurrency).await {
                Ok(link) => {
                    let link = Arc::new(link);
                    if links.contains_key(&link.sender_id) {
                        tracing::warn!(sender_id = %link.sender_id, "sender reconnected; replacing link");
                    }
                    links.insert(link.sender_id.clone(), link.clone());
                    fetch_loop(link.clone(), pipeline.events(), cancel).await;
                    links.remove(&link.sender_id);
                }
                Err(err) => {
                    tracing::error!(error = %err, "sender handshake failed");
                }
            }
        });
    }
    tracing::debug!("data accept task exiting");
}

async fn handshake(
    conn: Arc<Connection>,
    arena: Arc<RegionArena>,
    mode: DataPlaneMode,
    per_sender_fetch_concurrency: usize,
) -> Result<SenderLink> {
    let sender_id = conn.recv_string().await?;
    let regions_json = conn.recv_string().await?;
    let regions: Vec<RemoteRegion> = serde_json::from_str(&regions_json)?;

    let plane: Arc<dyn DataPlane> = match mode {
        DataPlaneMode::Rma => Arc::new(RmaDataPlane::new(
            conn.clone(),
            regions,
            per_sender_fetch_concurrency,
            arena,
        )),
        DataPlaneMode::Copy => Arc::new(CopyDataPlane::new(conn.clone())),
    };

    tracing::info!(sender_id = %sender_id, mode = %mode, "sender connected");
    Ok(SenderLink {
        sender_id,
        conn,
        plane,
    })
}

async fn heartbeat_task(
    builder_id: String,
    capacity: Arc<BuilderCapacity>,
    scheduler: Arc<dyn SchedulerApi>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let heartbeat = Heartbeat {
            process_id: builder_id.clone(),
            role: ProcessRole::TfBuilder,
            ts_ms: now_ms(),
            capacity: Some(capacity.snapshot()),
        };
        if let Err(err) = scheduler.heartbeat(heartbeat).await {
            tracing::warn!(error = %err, "heartbeat failed");
        }
    }
    tracing::debug!("heartbeat task exiting");
}

impl BuilderHandle {
    pub async fn shutdown(&self) {
        let _ = withdraw_endpoints(
            self.kv.as_ref(),
            &self.partition_id,
            ProcessRole::TfBuilder,
            &self.builder_id,
        )
        .await;
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

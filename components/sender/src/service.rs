// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sender process assembly.
//!
//! Registers the data region, starts the RPC endpoint, resolves the
//! scheduler from the discovery store, publishes its own endpoints and runs
//! the intake and heartbeat loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::discovery::{
    KeyValueStore, await_scheduler, publish_endpoints, withdraw_endpoints,
};
use tfdist_runtime::model::{StfFragment, now_ms};
use tfdist_runtime::region::{RegionArena, RegionRegistry};
use tfdist_runtime::rpc::{
    Heartbeat, ProcessEndpoints, RpcServer, SchedulerApi, ServiceDispatcher,
};
use tfdist_runtime::transport::RemoteRegion;
use tfdist_runtime::{ProcessRole, Result, RuntimeConfig, raise};

use crate::egress::EgressEngine;
use crate::ingress::Ingress;
use crate::rpc::SenderRpc;
use crate::store::SenderStfStore;

pub struct SenderService;

/// Running sender; dropping it does not stop the process, call
/// [`SenderHandle::shutdown`].
pub struct SenderHandle {
    pub sender_id: String,
    pub rpc_endpoint: String,
    pub store: Arc<SenderStfStore>,
    partition_id: String,
    kv: Arc<dyn KeyValueStore>,
    cancel: CancellationToken,
}

impl SenderService {
    pub async fn start(
        config: RuntimeConfig,
        kv: Arc<dyn KeyValueStore>,
        source: mpsc::Receiver<StfFragment>,
    ) -> Result<SenderHandle> {
        config.validate()?;
        let sender_id = config.process_id.clone();
        if sender_id.is_empty() {
            raise!("sender requires a process_id");
        }

        let cancel = CancellationToken::new();

        // data region; failure here is fatal for the process
        let registry = Arc::new(RegionRegistry::new());
        let region = registry
            .register(config.region_size)
            .map_err(|e| tfdist_runtime::error!("region registration failed: {e}"))?;
        let arena = Arc::new(RegionArena::new(region));
        let store = Arc::new(SenderStfStore::new(arena));

        let egress = EgressEngine::new(
            sender_id.clone(),
            config.data_plane,
            config.max_frame_size,
            config.fetch_ack_timeout(),
            store.clone(),
            registry.clone(),
            cancel.clone(),
        );

        // control endpoint
        let server = RpcServer::bind(config.rpc_bind.as_str(), config.max_frame_size).await?;
        let rpc_endpoint = server.local_addr().to_string();

        let sender_rpc = SenderRpc::new(store.clone(), egress, cancel.clone());
        let dispatcher = ServiceDispatcher::new().with_sender(sender_rpc);
        tokio::spawn(server.serve(dispatcher, cancel.clone()));

        // resolve the scheduler
        let scheduler: Arc<dyn SchedulerApi> = Arc::new(await_scheduler(kv.as_ref(), &config).await?);

        // make ourselves discoverable
        let endpoints = ProcessEndpoints {
            process_id: sender_id.clone(),
            role: ProcessRole::StfSender,
            rpc_endpoint: rpc_endpoint.clone(),
            data_endpoint: None,
            regions: registry
                .region_list()
                .iter()
                .map(|r| RemoteRegion {
                    base: r.base(),
                    size: r.size(),
                    key: r.remote_key(),
                })
                .collect(),
        };
        publish_endpoints(kv.as_ref(), &config.partition_id, &endpoints).await?;

        // intake
        let ingress = Ingress::new(
            sender_id.clone(),
            store.clone(),
            scheduler.clone(),
            cancel.clone(),
        );
        tokio::spawn(ingress.run(source));

        // heartbeats
        tokio::spawn(heartbeat_task(
            sender_id.clone(),
            scheduler,
            config.heartbeat_interval(),
            cancel.clone(),
        ));

        tracing::info!(
            sender_id = %sender_id,
            rpc_endpoint = %rpc_endpoint,
            region_size = config.region_size,
            "sender started"
        );

        Ok(SenderHandle {
            sender_id,
            rpc_endpoint,
            store,
            partition_id: config.partition_id,
            kv,
            cancel,
        })
    }
}

async fn heartbeat_task(
    sender_id: String,
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
            process_id: sender_id.clone(),
            role: ProcessRole::StfSender,
            ts_ms: now_ms(),
            capacity: None,
        };
        if let Err(err) = scheduler.heartbeat(heartbeat).await {
            tracing::warn!(error = %err, "heartbeat failed");
        }
    }
    tracing::debug!("heartbeat task exiting");
}

impl SenderHandle {
    /// Stop accepting work, withdraw from discovery and cancel every task.
    pub async fn shutdown(&self) {
        let _ = withdraw_endpoints(
            self.kv.as_ref(),
            &self.partition_id,
            ProcessRole::StfSender,
            &self.sender_id,
        )
        .await;
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

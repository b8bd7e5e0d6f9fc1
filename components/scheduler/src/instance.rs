// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler instance: RPC service, partition lifecycle and the background
//! sweeps (gather deadlines, stale builds, dead builders, fetch failures).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::discovery::{KeyValueStore, list_role, publish_endpoints, withdraw_endpoints};
use tfdist_runtime::model::TfId;
use tfdist_runtime::rpc::{
    BuildInstruction, BuildInstructionStatus, BuilderApi, ConnectStatus, Heartbeat,
    PartitionStateReply, ProcessEndpoints, RegisterBuilder, RegisterBuilderReply, RpcClient,
    RpcServer, SchedulerApi, ServiceDispatcher, StfAnnounce, StfAnnounceStatus,
    TerminatePartition, TfBuilt,
};
use tfdist_runtime::{PartitionState, ProcessRole, Result, RuntimeConfig, raise};

use crate::builder_pool::BuilderPool;
use crate::conn::{ConnManager, FetchFailure, FetchJob, SenderSetState};
use crate::tf_state::{AnnounceOutcome, CompleteTf, DropKind, RetiredTf, TfStateMap};

const SWEEP_PERIOD: Duration = Duration::from_millis(100);
const PARTITION_MONITOR_PERIOD: Duration = Duration::from_millis(500);
const DISCOVERY_POLL: Duration = Duration::from_millis(500);

pub struct SchedulerInstance {
    config: RuntimeConfig,
    partition_state: Mutex<PartitionState>,
    tf_state: Arc<TfStateMap>,
    pool: Arc<BuilderPool>,
    conn: Arc<ConnManager>,
    /// Completed TFs queue here; one worker assigns them in completion
    /// order, which keeps every per-sender fetch queue ascending.
    assign_tx: mpsc::UnboundedSender<CompleteTf>,
    heartbeats_seen: AtomicU64,
    cancel: CancellationToken,
}

pub struct SchedulerHandle {
    pub rpc_endpoint: String,
    pub instance: Arc<SchedulerInstance>,
    partition_id: String,
    kv: Arc<dyn KeyValueStore>,
    cancel: CancellationToken,
}

impl SchedulerInstance {
    /// Bring up the scheduler: RPC endpoint, sender discovery (retried for
    /// up to the discovery timeout), connection manager and sweeps.
    pub async fn start(config: RuntimeConfig, kv: Arc<dyn KeyValueStore>) -> Result<SchedulerHandle> {
        config.validate()?;
        if config.stf_sender_ids.is_empty() {
            raise!("scheduler requires a non-empty stf_sender_ids list");
        }

        let cancel = CancellationToken::new();

        let server = RpcServer::bind(config.rpc_bind.as_str(), config.max_frame_size).await?;
        let rpc_endpoint = server.local_addr().to_string();

        // publish early so senders and builders can find us while we wait
        // for the sender set
        let endpoints = ProcessEndpoints {
            process_id: config.process_id.clone(),
            role: ProcessRole::Scheduler,
            rpc_endpoint: rpc_endpoint.clone(),
            data_endpoint: None,
            regions: Vec::new(),
        };
        publish_endpoints(kv.as_ref(), &config.partition_id, &endpoints).await?;

        let (sender_endpoints, discovery_ok) = discover_senders(kv.as_ref(), &config).await?;

        let (conn, failure_rx) = ConnManager::start(
            config.partition_id.clone(),
            sender_endpoints,
            config.max_frame_size,
            config.control_retry_attempts,
            cancel.clone(),
        );

        let tf_state = Arc::new(TfStateMap::new(
            config.stf_sender_ids.len(),
            config.gather_deadline(),
        ));
        let pool = Arc::new(BuilderPool::new(config.builder_dead_after()));

        let initial_state = if discovery_ok {
            PartitionState::Configuring
        } else {
            PartitionState::Error
        };

        let (assign_tx, assign_rx) = mpsc::unbounded_channel();

        let instance = Arc::new(SchedulerInstance {
            config: config.clone(),
            partition_state: Mutex::new(initial_state),
            tf_state,
            pool,
            conn,
            assign_tx,
            heartbeats_seen: AtomicU64::new(0),
            cancel: cancel.clone(),
        });

        let dispatcher = ServiceDispatcher::new().with_scheduler(instance.clone());
        tokio::spawn(server.serve(dispatcher, cancel.clone()));

        tokio::spawn(assignment_task(instance.clone(), assign_rx, cancel.clone()));
        tokio::spawn(sweep_task(instance.clone(), cancel.clone()));
        tokio::spawn(reaper_task(instance.clone(), cancel.clone()));
        tokio::spawn(failure_task(instance.clone(), failure_rx, cancel.clone()));
        tokio::spawn(partition_monitor_task(instance.clone(), cancel.clone()));

        tracing::info!(
            partition_id = %config.partition_id,
            rpc_endpoint = %rpc_endpoint,
            senders = config.stf_sender_ids.len(),
            "scheduler started"
        );

        Ok(SchedulerHandle {
            rpc_endpoint,
            instance,
            partition_id: config.partition_id,
            kv,
            cancel,
        })
    }

    pub fn partition_state(&self) -> PartitionState {
        *self.partition_state.lock()
    }

    /// `(built, dropped)` totals, for observability and tests.
    pub fn counters(&self) -> (u64, u64) {
        self.tf_state.counters()
    }

    pub fn outstanding(&self) -> usize {
        self.tf_state.outstanding()
    }

    /// Builders currently in the pool.
    pub fn builder_count(&self) -> usize {
        self.pool.len()
    }

    fn accepting_updates(&self) -> bool {
        matches!(
            self.partition_state(),
            PartitionState::Configuring | PartitionState::Configured
        )
    }

    fn update_partition_state(&self, new_state: PartitionState) {
        let mut state = self.partition_state.lock();
        if state.is_terminal() {
            return;
        }
        if *state != new_state {
            tracing::info!(from = %*state, to = %new_state, "partition state changed");
            *state = new_state;
        }
    }

    /// Pick a builder, instruct it, then queue the per-sender fetches.
    /// Capacity refusals rotate to the next candidate before giving up.
    async fn assign_tf(&self, complete: CompleteTf) {
        let CompleteTf {
            tf_id,
            senders,
            total_bytes,
        } = complete;

        let mut attempts = self.pool.len() + 1;
        while attempts > 0 {
            attempts -= 1;

            let Some((builder_id, client)) = self.pool.pick(tf_id, total_bytes) else {
                break;
            };

            let instruction = BuildInstruction {
                tf_id,
                total_bytes,
                sender_ids: senders.clone(),
            };
            match client.build_instruction(instruction).await {
                Ok(BuildInstructionStatus::Ok) => {
                    for sender_id in &senders {
                        self.conn
                            .enqueue_fetch(
                                sender_id,
                                FetchJob {
                                    tf_id,
                                    builder_id: builder_id.clone(),
                                },
                            )
                            .await;
                    }
                    self.tf_state.mark_building(tf_id, &builder_id);
                    tracing::debug!(
                        tf_id,
                        builder_id = %builder_id,
                        total_bytes,
                        senders = senders.len(),
                        "TimeFrame assigned"
                    );
                    return;
                }
                Ok(BuildInstructionStatus::ErrorCapacity) => {
                    tracing::info!(tf_id, builder_id = %builder_id, "builder refused admission");
                    self.pool.release(&builder_id, tf_id);
                    self.pool.mark_failure(&builder_id);
                }
                Err(err) => {
                    tracing::warn!(tf_id, builder_id = %builder_id, error = %err, "build instruction failed");
                    self.pool.release(&builder_id, tf_id);
                    self.pool.mark_failure(&builder_id);
                }
            }
        }

        // no builder could take it
        if let Some(retired) = self.tf_state.drop_tf(tf_id, DropKind::NoCapacity) {
            self.retire(retired, DropKind::NoCapacity);
        }
    }

    /// Fan out the cleanup of a dropped TF: command every announced sender
    /// to free, tell the assigned builder (if any) and release its
    /// reservation.
    fn retire(&self, retired: RetiredTf, kind: DropKind) {
        tracing::trace!(tf_id = retired.tf_id, reason = %kind, "retiring TimeFrame");
        tfdist_runtime::metrics::pipeline()
            .tfs_dropped
            .with_label_values(&[&self.config.process_id, &kind.to_string()])
            .inc();
        self.conn.drop_stfs_async(retired.tf_id, retired.senders);

        if let Some(builder_id) = retired.assigned_builder {
            self.pool.release(&builder_id, retired.tf_id);
            if let Some(client) = self.pool.client(&builder_id) {
                let tf_id = retired.tf_id;
                tokio::spawn(async move {
                    if let Err(err) = client.drop_tf(tf_id).await {
                        tracing::warn!(tf_id, error = %err, "builder drop command failed");
                    }
                });
            }
        }
    }
}

#[async_trait]
impl SchedulerApi for SchedulerInstance {
    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        let seen = self.heartbeats_seen.fetch_add(1, Ordering::Relaxed);
        if seen % 60 == 0 {
            tracing::debug!(total = seen + 1, "heartbeats received");
        }

        if heartbeat.role == ProcessRole::TfBuilder {
            if let Some(capacity) = &heartbeat.capacity {
                if !self.pool.update_heartbeat(&heartbeat.process_id, capacity) {
                    tracing::debug!(
                        builder_id = %heartbeat.process_id,
                        "heartbeat from unregistered builder; re-registration required"
                    );
                }
            }
        }
        Ok(())
    }

    async fn get_partition_state(&self) -> Result<PartitionStateReply> {
        let state = self.partition_state();
        if state.is_terminal() || state == PartitionState::Terminating {
            return Ok(PartitionStateReply {
                state,
                message: String::new(),
            });
        }

        let reply = match self.conn.sender_state() {
            SenderSetState::Ok => PartitionStateReply {
                state: PartitionState::Configured,
                message: "partition is fully configured".to_string(),
            },
            SenderSetState::Initializing => PartitionStateReply {
                state: PartitionState::Configuring,
                message: format!(
                    "partition is being configured ({} senders expected)",
                    self.conn.sender_count()
                ),
            },
            SenderSetState::Incomplete => PartitionStateReply {
                state: PartitionState::Error,
                message: "not all senders are reachable".to_string(),
            },
        };
        Ok(reply)
    }

    async fn num_stf_senders(&self) -> Result<u32> {
        Ok(self.tf_state.sender_count() as u32)
    }

    async fn stf_announce(&self, announce: StfAnnounce) -> Result<StfAnnounceStatus> {
        if !self.accepting_updates() {
            return Ok(StfAnnounceStatus::DropNotRunning);
        }

        let outcome = self.tf_state.add_announcement(
            &announce.sender_id,
            announce.tf_id,
            announce.size_bytes,
            announce.origin,
        );

        match outcome {
            AnnounceOutcome::Incomplete => Ok(StfAnnounceStatus::Ok),
            AnnounceOutcome::Complete(complete) => {
                // assignment runs off the announce path, in completion order
                if self.assign_tx.send(complete).is_err() {
                    return Ok(StfAnnounceStatus::DropNotRunning);
                }
                Ok(StfAnnounceStatus::Ok)
            }
            AnnounceOutcome::Stale => Ok(StfAnnounceStatus::DropRunning),
        }
    }

    async fn number_of_stfs(&self, tf_id: TfId) -> Result<Option<u32>> {
        Ok(self.tf_state.number_of_stfs(tf_id))
    }

    async fn terminate_partition(&self, req: TerminatePartition) -> Result<PartitionStateReply> {
        tracing::info!(partition_id = %req.partition_id, "terminate requested");

        let message = if self.accepting_updates() {
            self.update_partition_state(PartitionState::Terminating);
            "terminate started".to_string()
        } else {
            format!("terminate was already requested for {}", req.partition_id)
        };

        Ok(PartitionStateReply {
            state: self.partition_state(),
            message,
        })
    }

    async fn tf_built(&self, built: TfBuilt) -> Result<()> {
        self.pool.release(&built.builder_id, built.tf_id);
        match self.tf_state.complete(built.tf_id) {
            Some(retired) => {
                tracing::debug!(
                    tf_id = built.tf_id,
                    builder_id = %built.builder_id,
                    size_bytes = built.size_bytes,
                    announced = retired.total_bytes,
                    "TimeFrame built"
                );
            }
            None => {
                tracing::warn!(tf_id = built.tf_id, "built ack for an unknown TimeFrame");
            }
        }
        Ok(())
    }

    async fn register_builder(&self, req: RegisterBuilder) -> Result<RegisterBuilderReply> {
        if !self.accepting_updates() {
            return Ok(RegisterBuilderReply {
                status: ConnectStatus::ErrorTerminating,
                connected_senders: Vec::new(),
            });
        }
        if self.conn.sender_state() != SenderSetState::Ok {
            return Ok(RegisterBuilderReply {
                status: ConnectStatus::ErrorSendersNotReady,
                connected_senders: Vec::new(),
            });
        }

        let connected = match self
            .conn
            .connect_builder_everywhere(&req.builder_id, &req.data_endpoint)
            .await
        {
            Ok(connected) => connected,
            Err(err) => {
                tracing::error!(builder_id = %req.builder_id, error = %err, "builder connect fan-out failed");
                return Ok(RegisterBuilderReply {
                    status: ConnectStatus::ErrorTransport,
                    connected_senders: Vec::new(),
                });
            }
        };

        let client: Arc<dyn BuilderApi> = Arc::new(
            RpcClient::new(req.rpc_endpoint.clone(), self.config.max_frame_size)
                .with_retry_attempts(self.config.control_retry_attempts),
        );
        let stale = self.pool.register(
            &req.builder_id,
            client,
            req.rpc_endpoint,
            req.data_endpoint,
            &req.capacity,
        );
        // a re-registering builder abandons anything it still held
        for tf_id in stale {
            if let Some(retired) = self.tf_state.drop_tf(tf_id, DropKind::BuilderDead) {
                self.retire(retired, DropKind::BuilderDead);
            }
        }

        Ok(RegisterBuilderReply {
            status: ConnectStatus::Ok,
            connected_senders: connected,
        })
    }
}

/// Drains the completed-TF queue; one worker so assignments happen in
/// completion order.
async fn assignment_task(
    instance: Arc<SchedulerInstance>,
    mut queue: mpsc::UnboundedReceiver<CompleteTf>,
    cancel: CancellationToken,
) {
    loop {
        let complete = tokio::select! {
            complete = queue.recv() => match complete {
                Some(complete) => complete,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        instance.assign_tf(complete).await;
    }
    tracing::debug!("assignment worker exiting");
}

async fn discover_senders(
    kv: &dyn KeyValueStore,
    config: &RuntimeConfig,
) -> Result<(Vec<(String, String)>, bool)> {
    let deadline = tokio::time::Instant::now() + config.discovery_timeout();

    loop {
        let records = list_role(kv, &config.partition_id, ProcessRole::StfSender).await?;
        let resolved: Vec<(String, String)> = config
            .stf_sender_ids
            .iter()
            .filter_map(|id| {
                records
                    .iter()
                    .find(|r| &r.process_id == id)
                    .map(|r| (id.clone(), r.rpc_endpoint.clone()))
            })
            .collect();

        if resolved.len() == config.stf_sender_ids.len() {
            return Ok((resolved, true));
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::error!(
                found = resolved.len(),
                expected = config.stf_sender_ids.len(),
                "sender discovery timed out"
            );
            return Ok((resolved, false));
        }

        tracing::info!(
            found = resolved.len(),
            expected = config.stf_sender_ids.len(),
            "waiting for senders"
        );
        tokio::time::sleep(DISCOVERY_POLL).await;
    }
}

/// Gather-deadline and stale-build sweep.
async fn sweep_task(instance: Arc<SchedulerInstance>, cancel: CancellationToken) {
    let stale_build_age =
        instance.config.fetch_ack_timeout() + instance.config.gather_deadline();
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        for retired in instance.tf_state.take_expired() {
            instance.retire(retired, DropKind::Timeout);
        }
        for retired in instance.tf_state.take_stale_building(stale_build_age) {
            tracing::warn!(tf_id = retired.tf_id, "build never completed; dropping");
            instance.retire(retired, DropKind::StaleBuild);
        }
    }
}

/// Dead-builder reaper: releases reservations, re-drops affected TFs and
/// removes the builder from the pool.
async fn reaper_task(instance: Arc<SchedulerInstance>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(instance.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        for dead in instance.pool.reap_dead() {
            let mut affected = dead.reserved_tfs;
            affected.extend(instance.tf_state.assigned_to(&dead.builder_id));
            affected.sort_unstable();
            affected.dedup();

            for tf_id in affected {
                if let Some(retired) = instance.tf_state.drop_tf(tf_id, DropKind::BuilderDead) {
                    instance.conn.drop_stfs_async(retired.tf_id, retired.senders);
                }
            }

            let reply = instance
                .conn
                .disconnect_builder_everywhere(&dead.builder_id)
                .await;
            if !reply.is_ok() {
                tracing::warn!(
                    builder_id = %dead.builder_id,
                    errors = ?reply.errors,
                    "disconnect fan-out reported errors"
                );
            }
        }
    }
}

/// Drops TFs whose fetch fan-out failed at some sender.
async fn failure_task(
    instance: Arc<SchedulerInstance>,
    mut failures: mpsc::UnboundedReceiver<FetchFailure>,
    cancel: CancellationToken,
) {
    loop {
        let failure = tokio::select! {
            failure = failures.recv() => match failure {
                Some(failure) => failure,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        tracing::warn!(
            tf_id = failure.tf_id,
            sender_id = %failure.sender_id,
            status = ?failure.status,
            "fetch fan-out failed; dropping TimeFrame"
        );
        if let Some(retired) = instance.tf_state.drop_tf(failure.tf_id, DropKind::FetchFailed) {
            instance.retire(retired, DropKind::FetchFailed);
        }
    }
}

/// Drives the coarse partition lifecycle; during `Terminating` it keeps
/// fanning out terminate requests until the fleet is gone.
async fn partition_monitor_task(instance: Arc<SchedulerInstance>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PARTITION_MONITOR_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let state = instance.partition_state();
        if state == PartitionState::Terminating {
            for retired in instance.tf_state.drop_all(DropKind::Terminated) {
                instance.retire(retired, DropKind::Terminated);
            }

            for (builder_id, client) in instance.pool.clients() {
                let req = TerminatePartition {
                    partition_id: instance.config.partition_id.clone(),
                };
                if let Err(err) = client.terminate(req).await {
                    tracing::warn!(builder_id = %builder_id, error = %err, "builder terminate failed");
                }
                instance.pool.remove(&builder_id);
            }

            if instance.conn.request_senders_terminate().await {
                tracing::info!("all senders requested to terminate");
            }

            if instance.pool.is_empty() {
                instance.update_partition_state(PartitionState::Terminated);
                tracing::info!("partition terminated");
                break;
            }
            continue;
        }
        if state.is_terminal() {
            break;
        }

        match instance.conn.sender_state() {
            SenderSetState::Ok => instance.update_partition_state(PartitionState::Configured),
            SenderSetState::Initializing => {
                instance.update_partition_state(PartitionState::Configuring)
            }
            SenderSetState::Incomplete => instance.update_partition_state(PartitionState::Error),
        }
    }
    tracing::debug!("partition monitor exiting");
}

impl SchedulerHandle {
    pub async fn shutdown(&self) {
        let _ = withdraw_endpoints(
            self.kv.as_ref(),
            &self.partition_id,
            ProcessRole::Scheduler,
            &self.instance.config.process_id,
        )
        .await;
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

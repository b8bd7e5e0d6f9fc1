// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Discovery and shared configuration.
//!
//! The pipeline needs only a small key-value surface from its configuration
//! store: `get`, `set`, `delete`, prefix listing and prefix watch. Real
//! deployments point this trait at an external store; the in-memory
//! implementation backs tests and single-host runs.
//!
//! Every process publishes its endpoints under
//! `partition/<partition_id>/<role>/<process_id>`; the scheduler resolves
//! the sender set from there at startup.

mod memory;

pub use memory::MemoryStore;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::rpc::ProcessEndpoints;
use crate::{ProcessRole, Result};

/// A change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(String, Bytes),
    Delete(String),
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Minimal key-value surface of the external configuration store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>>;

    /// Watch for changes under `prefix` until `cancel` fires. Events for
    /// keys already present are not replayed; list first, then watch.
    async fn watch_prefix(&self, prefix: &str, cancel: CancellationToken) -> Result<WatchStream>;
}

/// Key of one process's endpoint record.
pub fn endpoint_key(partition_id: &str, role: ProcessRole, process_id: &str) -> String {
    format!("partition/{partition_id}/{role}/{process_id}")
}

/// Prefix under which every process of a role publishes.
pub fn role_prefix(partition_id: &str, role: ProcessRole) -> String {
    format!("partition/{partition_id}/{role}/")
}

/// Publish this process's endpoints.
pub async fn publish_endpoints(
    store: &dyn KeyValueStore,
    partition_id: &str,
    endpoints: &ProcessEndpoints,
) -> Result<()> {
    let key = endpoint_key(partition_id, endpoints.role, &endpoints.process_id);
    let value = serde_json::to_vec(endpoints)?;
    store.set(&key, value.into()).await
}

/// Remove this process's endpoint record (graceful shutdown).
pub async fn withdraw_endpoints(
    store: &dyn KeyValueStore,
    partition_id: &str,
    role: ProcessRole,
    process_id: &str,
) -> Result<()> {
    store
        .delete(&endpoint_key(partition_id, role, process_id))
        .await
}

/// All endpoint records of one role. Records that fail to parse are logged
/// and skipped.
pub async fn list_role(
    store: &dyn KeyValueStore,
    partition_id: &str,
    role: ProcessRole,
) -> Result<Vec<ProcessEndpoints>> {
    let entries = store.list_prefix(&role_prefix(partition_id, role)).await?;

    let mut endpoints = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match serde_json::from_slice::<ProcessEndpoints>(&value) {
            Ok(record) => endpoints.push(record),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "skipping malformed endpoint record");
            }
        }
    }
    Ok(endpoints)
}

/// Resolve the partition's scheduler, polling the store until it appears or
/// the discovery timeout elapses.
pub async fn await_scheduler(
    store: &dyn KeyValueStore,
    config: &crate::RuntimeConfig,
) -> Result<crate::rpc::RpcClient> {
    const POLL: std::time::Duration = std::time::Duration::from_millis(500);
    let deadline = tokio::time::Instant::now() + config.discovery_timeout();

    loop {
        let schedulers = list_role(store, &config.partition_id, ProcessRole::Scheduler).await?;
        if let Some(record) = schedulers.first() {
            return Ok(
                crate::rpc::RpcClient::new(record.rpc_endpoint.clone(), config.max_frame_size)
                    .with_retry_attempts(config.control_retry_attempts),
            );
        }
        if tokio::time::Instant::now() >= deadline {
            crate::raise!(
                "no scheduler for partition {} within {:?}",
                config.partition_id,
                config.discovery_timeout()
            );
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Fetch one process's endpoint record.
pub async fn get_endpoints(
    store: &dyn KeyValueStore,
    partition_id: &str,
    role: ProcessRole,
    process_id: &str,
) -> Result<Option<ProcessEndpoints>> {
    let key = endpoint_key(partition_id, role, process_id);
    match store.get(&key).await? {
        Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
        None => Ok(None),
    }
}

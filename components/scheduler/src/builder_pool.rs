// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Builder registry and assignment policy.
//!
//! Tracks every registered builder's capacity (scheduler-side view),
//! liveness and recent failures. Selection picks the builder with the
//! lowest `reserved/total` share among those with enough free space,
//! tie-broken by in-flight count and then id; the reservation is taken
//! under the pool lock, before the TF leaves `Assigning`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tfdist_runtime::model::{BuilderId, TfId};
use tfdist_runtime::rpc::{BuilderApi, BuilderCapacityInfo};

/// Recent-failure cooldown: a builder that refused or failed an instruction
/// is not considered for this long.
const FAILURE_COOLDOWN: Duration = Duration::from_secs(5);

struct BuilderInfo {
    client: Arc<dyn BuilderApi>,
    rpc_endpoint: String,
    data_endpoint: String,
    total_bytes: u64,
    reserved_bytes: u64,
    reservations: HashMap<TfId, u64>,
    last_heartbeat: Instant,
    last_failure: Option<Instant>,
}

impl BuilderInfo {
    fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.reserved_bytes)
    }

    fn load_share(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.reserved_bytes as f64 / self.total_bytes as f64
    }
}

/// A dead builder and the reservations it still held.
pub struct DeadBuilder {
    pub builder_id: BuilderId,
    pub reserved_tfs: Vec<TfId>,
}

pub struct BuilderPool {
    dead_after: Duration,
    inner: Mutex<HashMap<BuilderId, BuilderInfo>>,
}

impl BuilderPool {
    pub fn new(dead_after: Duration) -> Self {
        Self {
            dead_after,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Full (re-)registration. A re-registering builder starts from a clean
    /// slate; its stale reservations are returned for cleanup.
    pub fn register(
        &self,
        builder_id: &BuilderId,
        client: Arc<dyn BuilderApi>,
        rpc_endpoint: String,
        data_endpoint: String,
        capacity: &BuilderCapacityInfo,
    ) -> Vec<TfId> {
        let mut inner = self.inner.lock();
        let stale = inner
            .remove(builder_id)
            .map(|old| old.reservations.keys().copied().collect())
            .unwrap_or_default();

        inner.insert(
            builder_id.clone(),
            BuilderInfo {
                client,
                rpc_endpoint,
                data_endpoint,
                total_bytes: capacity.total_bytes,
                reserved_bytes: 0,
                reservations: HashMap::new(),
                last_heartbeat: Instant::now(),
                last_failure: None,
            },
        );
        let info = &inner[builder_id];
        tracing::info!(
            builder_id = %builder_id,
            rpc_endpoint = %info.rpc_endpoint,
            data_endpoint = %info.data_endpoint,
            total_bytes = info.total_bytes,
            "builder registered"
        );
        stale
    }

    /// Heartbeat intake: refresh liveness, log capacity drift.
    pub fn update_heartbeat(&self, builder_id: &BuilderId, capacity: &BuilderCapacityInfo) -> bool {
        let mut inner = self.inner.lock();
        let Some(info) = inner.get_mut(builder_id) else {
            return false;
        };
        info.last_heartbeat = Instant::now();
        if capacity.reserved_bytes != info.reserved_bytes {
            tracing::trace!(
                builder_id = %builder_id,
                reported = capacity.reserved_bytes,
                tracked = info.reserved_bytes,
                "capacity drift between heartbeat and scheduler view"
            );
        }
        true
    }

    pub fn contains(&self, builder_id: &BuilderId) -> bool {
        self.inner.lock().contains_key(builder_id)
    }

    /// Pick a builder for `size_bytes` and reserve atomically.
    pub fn pick(&self, tf_id: TfId, size_bytes: u64) -> Option<(BuilderId, Arc<dyn BuilderApi>)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let mut best: Option<(&BuilderId, f64, u64)> = None;
        for (builder_id, info) in inner.iter() {
            if now.duration_since(info.last_heartbeat) > self.dead_after {
                continue;
            }
            if let Some(failed_at) = info.last_failure {
                if now.duration_since(failed_at) < FAILURE_COOLDOWN {
                    continue;
                }
            }
            if info.free_bytes() < size_bytes {
                continue;
            }

            let share = info.load_share();
            let in_flight = info.reservations.len() as u64;
            let better = match &best {
                None => true,
                Some((best_id, best_share, best_in_flight)) => {
                    share < *best_share
                        || (share == *best_share && in_flight < *best_in_flight)
                        || (share == *best_share
                            && in_flight == *best_in_flight
                            && builder_id < *best_id)
                }
            };
            if better {
                best = Some((builder_id, share, in_flight));
            }
        }

        let builder_id = best.map(|(id, _, _)| id.clone())?;
        let info = inner.get_mut(&builder_id)?;
        info.reserved_bytes += size_bytes;
        info.reservations.insert(tf_id, size_bytes);
        Some((builder_id, info.client.clone()))
    }

    /// Release one TF's reservation (built, dropped, or refused).
    pub fn release(&self, builder_id: &BuilderId, tf_id: TfId) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.get_mut(builder_id) {
            if let Some(bytes) = info.reservations.remove(&tf_id) {
                info.reserved_bytes = info.reserved_bytes.saturating_sub(bytes);
            }
        }
    }

    pub fn mark_failure(&self, builder_id: &BuilderId) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.get_mut(builder_id) {
            info.last_failure = Some(Instant::now());
        }
    }

    pub fn client(&self, builder_id: &BuilderId) -> Option<Arc<dyn BuilderApi>> {
        self.inner.lock().get(builder_id).map(|i| i.client.clone())
    }

    pub fn clients(&self) -> Vec<(BuilderId, Arc<dyn BuilderApi>)> {
        self.inner
            .lock()
            .iter()
            .map(|(id, info)| (id.clone(), info.client.clone()))
            .collect()
    }

    /// Remove builders whose heartbeat went silent beyond the threshold.
    pub fn reap_dead(&self) -> Vec<DeadBuilder> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let dead: Vec<BuilderId> = inner
            .iter()
            .filter(|(_, info)| now.duration_since(info.last_heartbeat) > self.dead_after)
            .map(|(id, _)| id.clone())
            .collect();

        dead.into_iter()
            .filter_map(|builder_id| {
                inner.remove(&builder_id).map(|info| {
                    tracing::warn!(
                        builder_id = %builder_id,
                        reserved_tfs = info.reservations.len(),
                        "builder heartbeat lost; removing from pool"
                    );
                    DeadBuilder {
                        builder_id,
                        reserved_tfs: info.reservations.keys().copied().collect(),
                    }
                })
            })
            .collect()
    }

    /// Explicit removal (disconnect); returns held reservations.
    pub fn remove(&self, builder_id: &BuilderId) -> Vec<TfId> {
        self.inner
            .lock()
            .remove(builder_id)
            .map(|info| info.reservations.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tfdist_runtime::Result;
    use tfdist_runtime::rpc::{BuildInstruction, BuildInstructionStatus, TerminatePartition};

    struct NullBuilder;

    #[async_trait]
    impl BuilderApi for NullBuilder {
        async fn build_instruction(
            &self,
            _instruction: BuildInstruction,
        ) -> Result<BuildInstructionStatus> {
            Ok(BuildInstructionStatus::Ok)
        }
        async fn drop_tf(&self, _tf_id: TfId) -> Result<()> {
            Ok(())
        }
        async fn terminate(&self, _req: TerminatePartition) -> Result<()> {
            Ok(())
        }
    }

    fn pool() -> BuilderPool {
        BuilderPool::new(Duration::from_secs(10))
    }

    fn capacity(total: u64) -> BuilderCapacityInfo {
        BuilderCapacityInfo {
            total_bytes: total,
            reserved_bytes: 0,
            free_bytes: total,
            in_flight_tfs: 0,
        }
    }

    fn add(pool: &BuilderPool, id: &str, total: u64) {
        pool.register(
            &id.to_string(),
            Arc::new(NullBuilder),
            format!("127.0.0.1:0/{id}"),
            format!("127.0.0.1:0/{id}-data"),
            &capacity(total),
        );
    }

    #[test]
    fn test_pick_lowest_share() {
        let pool = pool();
        add(&pool, "builder-a", 16 << 20);
        add(&pool, "builder-b", 16 << 20);

        // load builder-a
        let (first, _) = pool.pick(1, 8 << 20).unwrap();
        // next pick must go to the other builder (lower share)
        let (second, _) = pool.pick(2, 1 << 20).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_pick_respects_free_bytes() {
        let pool = pool();
        add(&pool, "builder-a", 4 << 20);

        assert!(pool.pick(1, 8 << 20).is_none());
        assert!(pool.pick(2, 4 << 20).is_some());
        // now full
        assert!(pool.pick(3, 1).is_none());

        pool.release(&"builder-a".to_string(), 2);
        assert!(pool.pick(4, 1 << 20).is_some());
    }

    #[test]
    fn test_tie_break_by_id() {
        let pool = pool();
        add(&pool, "builder-b", 8 << 20);
        add(&pool, "builder-a", 8 << 20);

        let (picked, _) = pool.pick(1, 1 << 20).unwrap();
        assert_eq!(picked, "builder-a");
    }

    #[test]
    fn test_failed_builder_cooldown() {
        let pool = pool();
        add(&pool, "builder-a", 8 << 20);

        pool.mark_failure(&"builder-a".to_string());
        assert!(pool.pick(1, 1024).is_none());
    }

    #[test]
    fn test_reap_dead_returns_reservations() {
        let pool = BuilderPool::new(Duration::from_millis(20));
        add(&pool, "builder-a", 8 << 20);
        pool.pick(103, 1 << 20).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let dead = pool.reap_dead();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].builder_id, "builder-a");
        assert_eq!(dead[0].reserved_tfs, vec![103]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_reregistration_resets_reservations() {
        let pool = pool();
        add(&pool, "builder-a", 8 << 20);
        pool.pick(1, 1 << 20).unwrap();

        let stale = pool.register(
            &"builder-a".to_string(),
            Arc::new(NullBuilder),
            "ep".to_string(),
            "ep-data".to_string(),
            &capacity(8 << 20),
        );
        assert_eq!(stale, vec![1]);

        // fresh slate
        let (id, _) = pool.pick(2, 8 << 20).unwrap();
        assert_eq!(id, "builder-a");
    }
}

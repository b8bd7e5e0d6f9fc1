// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-TF state machine.
//!
//! One record per announced `tf_id`, created on the first announcement and
//! removed on `Done` or `Dropped`:
//!
//! ```text
//! Gathering --all senders announced--> Assigning --instructed--> Building
//!     |                                   |                        |
//!     +--deadline/stale/no capacity-------+------------------------+--> Dropped
//!                                                  Building --builder ack--> Done
//! ```
//!
//! Announcements per sender must be strictly increasing; a reordered
//! announcement is refused and dropped on that sender alone. Topology TFs
//! complete at their single announcement.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tfdist_runtime::model::{BuilderId, SenderId, StfOrigin, TfId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfState {
    Gathering,
    Assigning,
    Building,
}

/// Why a TF left the map without being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    Timeout,
    NoCapacity,
    FetchFailed,
    BuilderDead,
    StaleBuild,
    Terminated,
}

impl std::fmt::Display for DropKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DropKind::Timeout => "timeout",
            DropKind::NoCapacity => "no_capacity",
            DropKind::FetchFailed => "fetch_failed",
            DropKind::BuilderDead => "builder_dead",
            DropKind::StaleBuild => "stale_build",
            DropKind::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

struct TfRecord {
    announcements: BTreeMap<SenderId, u64>,
    origin: StfOrigin,
    state: TfState,
    assigned_builder: Option<BuilderId>,
    deadline: Instant,
    state_since: Instant,
}

impl TfRecord {
    fn total_bytes(&self) -> u64 {
        self.announcements.values().sum()
    }
}

/// Snapshot handed to the assignment path when a TF completes gathering.
#[derive(Debug, Clone)]
pub struct CompleteTf {
    pub tf_id: TfId,
    pub senders: Vec<SenderId>,
    pub total_bytes: u64,
}

/// Result of recording one announcement.
pub enum AnnounceOutcome {
    /// Recorded; more senders expected.
    Incomplete,
    /// All senders announced; the TF moved to `Assigning`.
    Complete(CompleteTf),
    /// Violates per-sender monotonicity (reorder or duplicate).
    Stale,
}

/// Snapshot of a dropped/finished TF for the cleanup fan-out.
pub struct RetiredTf {
    pub tf_id: TfId,
    pub senders: Vec<SenderId>,
    pub assigned_builder: Option<BuilderId>,
    pub total_bytes: u64,
}

pub struct TfStateMap {
    gather_deadline: Duration,
    sender_count: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    records: BTreeMap<TfId, TfRecord>,
    last_announced: HashMap<SenderId, TfId>,
    built_total: u64,
    dropped_total: u64,
}

impl TfStateMap {
    pub fn new(sender_count: usize, gather_deadline: Duration) -> Self {
        Self {
            gather_deadline,
            sender_count,
            inner: Mutex::new(Inner {
                records: BTreeMap::new(),
                last_announced: HashMap::new(),
                built_total: 0,
                dropped_total: 0,
            }),
        }
    }

    pub fn sender_count(&self) -> usize {
        self.sender_count
    }

    /// Record one announcement. The record is created on the first
    /// announcement of the id; completeness is measured against the sender
    /// set size, or one announcement for topology TFs.
    pub fn add_announcement(
        &self,
        sender_id: &SenderId,
        tf_id: TfId,
        size_bytes: u64,
        origin: StfOrigin,
    ) -> AnnounceOutcome {
        let mut inner = self.inner.lock();

        // per-sender monotonicity
        if let Some(&last) = inner.last_announced.get(sender_id) {
            if tf_id <= last {
                tracing::error!(
                    sender_id = %sender_id,
                    tf_id,
                    last,
                    "reordered announcement refused"
                );
                return AnnounceOutcome::Stale;
            }
        }
        inner.last_announced.insert(sender_id.clone(), tf_id);

        let deadline = Instant::now() + self.gather_deadline;
        let record = inner.records.entry(tf_id).or_insert_with(|| TfRecord {
            announcements: BTreeMap::new(),
            origin,
            state: TfState::Gathering,
            assigned_builder: None,
            deadline,
            state_since: Instant::now(),
        });

        if record.state != TfState::Gathering {
            tracing::warn!(tf_id, sender_id = %sender_id, "announcement after assignment; ignored");
            return AnnounceOutcome::Incomplete;
        }

        record.announcements.insert(sender_id.clone(), size_bytes);

        // topology TFs are one-sender builds with trivial completion
        let expected = match record.origin {
            StfOrigin::Topology => 1,
            _ => self.sender_count,
        };

        if record.announcements.len() >= expected {
            record.state = TfState::Assigning;
            record.state_since = Instant::now();
            AnnounceOutcome::Complete(CompleteTf {
                tf_id,
                senders: record.announcements.keys().cloned().collect(),
                total_bytes: record.total_bytes(),
            })
        } else {
            AnnounceOutcome::Incomplete
        }
    }

    /// `Assigning -> Building` once every fetch request is queued.
    pub fn mark_building(&self, tf_id: TfId, builder_id: &BuilderId) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(&tf_id) {
            record.state = TfState::Building;
            record.assigned_builder = Some(builder_id.clone());
            record.state_since = Instant::now();
        }
    }

    /// Builder ack: `Building -> Done`, record removed.
    pub fn complete(&self, tf_id: TfId) -> Option<RetiredTf> {
        let mut inner = self.inner.lock();
        let record = inner.records.remove(&tf_id)?;
        inner.built_total += 1;
        let total_bytes = record.total_bytes();
        Some(RetiredTf {
            tf_id,
            senders: record.announcements.keys().cloned().collect(),
            assigned_builder: record.assigned_builder,
            total_bytes,
        })
    }

    /// Any state `-> Dropped`, record removed. Returns the announced senders
    /// so the caller can command the drop fan-out. Idempotent.
    pub fn drop_tf(&self, tf_id: TfId, kind: DropKind) -> Option<RetiredTf> {
        let mut inner = self.inner.lock();
        let record = inner.records.remove(&tf_id)?;
        inner.dropped_total += 1;
        tracing::info!(tf_id, reason = %kind, "TimeFrame dropped");
        let total_bytes = record.total_bytes();
        Some(RetiredTf {
            tf_id,
            senders: record.announcements.keys().cloned().collect(),
            assigned_builder: record.assigned_builder,
            total_bytes,
        })
    }

    /// Gathering TFs whose deadline passed with an incomplete sender set.
    pub fn take_expired(&self) -> Vec<RetiredTf> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<TfId> = inner
            .records
            .iter()
            .filter(|(_, r)| r.state == TfState::Gathering && r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut retired = Vec::with_capacity(expired.len());
        for tf_id in expired {
            if let Some(record) = inner.records.remove(&tf_id) {
                inner.dropped_total += 1;
                tracing::warn!(
                    tf_id,
                    announced = record.announcements.len(),
                    expected = self.sender_count,
                    "gather deadline expired"
                );
                let total_bytes = record.total_bytes();
                retired.push(RetiredTf {
                    tf_id,
                    senders: record.announcements.keys().cloned().collect(),
                    assigned_builder: record.assigned_builder,
                    total_bytes,
                });
            }
        }
        retired
    }

    /// Building TFs stuck beyond `max_age` (e.g. builder never acked).
    pub fn take_stale_building(&self, max_age: Duration) -> Vec<RetiredTf> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let stale: Vec<TfId> = inner
            .records
            .iter()
            .filter(|(_, r)| r.state == TfState::Building && now.duration_since(r.state_since) > max_age)
            .map(|(id, _)| *id)
            .collect();

        let mut retired = Vec::with_capacity(stale.len());
        for tf_id in stale {
            if let Some(record) = inner.records.remove(&tf_id) {
                inner.dropped_total += 1;
                let total_bytes = record.total_bytes();
                retired.push(RetiredTf {
                    tf_id,
                    senders: record.announcements.keys().cloned().collect(),
                    assigned_builder: record.assigned_builder,
                    total_bytes,
                });
            }
        }
        retired
    }

    /// TFs assigned to one builder (for the death sweep).
    pub fn assigned_to(&self, builder_id: &BuilderId) -> Vec<TfId> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|(_, r)| r.assigned_builder.as_ref() == Some(builder_id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// `NumberOfStfs`: known once the TF reached `Building`.
    pub fn number_of_stfs(&self, tf_id: TfId) -> Option<u32> {
        let inner = self.inner.lock();
        inner.records.get(&tf_id).and_then(|r| match r.state {
            TfState::Building => Some(r.announcements.len() as u32),
            _ => None,
        })
    }

    pub fn drop_all(&self, kind: DropKind) -> Vec<RetiredTf> {
        let ids: Vec<TfId> = self.inner.lock().records.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.drop_tf(id, kind)).collect()
    }

    /// `(built, dropped)` totals.
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.built_total, inner.dropped_total)
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(senders: usize) -> TfStateMap {
        TfStateMap::new(senders, Duration::from_millis(50))
    }

    #[test]
    fn test_gathering_to_complete() {
        let state = map(2);

        let outcome =
            state.add_announcement(&"sender-a".to_string(), 100, 1 << 20, StfOrigin::Physics);
        assert!(matches!(outcome, AnnounceOutcome::Incomplete));

        let outcome =
            state.add_announcement(&"sender-b".to_string(), 100, 2 << 20, StfOrigin::Physics);
        let AnnounceOutcome::Complete(complete) = outcome else {
            panic!("expected Complete");
        };
        assert_eq!(complete.tf_id, 100);
        assert_eq!(complete.total_bytes, 3 << 20);
        assert_eq!(complete.senders.len(), 2);
    }

    #[test]
    fn test_reordered_announcement_is_stale() {
        let state = map(2);
        let sender = "sender-a".to_string();

        assert!(matches!(
            state.add_announcement(&sender, 201, 1024, StfOrigin::Physics),
            AnnounceOutcome::Incomplete
        ));
        assert!(matches!(
            state.add_announcement(&sender, 200, 1024, StfOrigin::Physics),
            AnnounceOutcome::Stale
        ));
        assert!(matches!(
            state.add_announcement(&sender, 201, 1024, StfOrigin::Physics),
            AnnounceOutcome::Stale
        ));
        // the next id continues normally
        assert!(matches!(
            state.add_announcement(&sender, 202, 1024, StfOrigin::Physics),
            AnnounceOutcome::Incomplete
        ));
    }

    #[test]
    fn test_topology_completes_at_one() {
        let state = map(2);
        let outcome =
            state.add_announcement(&"sender-a".to_string(), 7, 4096, StfOrigin::Topology);
        assert!(matches!(outcome, AnnounceOutcome::Complete(_)));
    }

    #[test]
    fn test_expiry_drops_incomplete() {
        let state = map(2);
        state.add_announcement(&"sender-a".to_string(), 101, 1 << 20, StfOrigin::Physics);

        assert!(state.take_expired().is_empty());
        std::thread::sleep(Duration::from_millis(80));

        let expired = state.take_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].tf_id, 101);
        assert_eq!(expired[0].senders, vec!["sender-a".to_string()]);
        assert_eq!(state.outstanding(), 0);
        assert_eq!(state.counters().1, 1);
    }

    #[test]
    fn test_number_of_stfs_pending_until_building() {
        let state = map(1);
        state.add_announcement(&"sender-a".to_string(), 5, 1024, StfOrigin::Physics);
        assert_eq!(state.number_of_stfs(5), None);

        state.mark_building(5, &"builder-01".to_string());
        assert_eq!(state.number_of_stfs(5), Some(1));

        assert!(state.complete(5).is_some());
        assert_eq!(state.number_of_stfs(5), None);
        assert_eq!(state.counters().0, 1);
    }

    #[test]
    fn test_drop_is_idempotent() {
        let state = map(1);
        state.add_announcement(&"sender-a".to_string(), 5, 1024, StfOrigin::Physics);

        assert!(state.drop_tf(5, DropKind::NoCapacity).is_some());
        assert!(state.drop_tf(5, DropKind::NoCapacity).is_none());
    }

    #[test]
    fn test_assigned_to_builder() {
        let state = map(1);
        for tf_id in [1u64, 2, 3] {
            state.add_announcement(&"sender-a".to_string(), tf_id, 1024, StfOrigin::Physics);
        }
        state.mark_building(1, &"builder-a".to_string());
        state.mark_building(3, &"builder-a".to_string());
        state.mark_building(2, &"builder-b".to_string());

        assert_eq!(state.assigned_to(&"builder-a".to_string()), vec![1, 3]);
        assert_eq!(state.assigned_to(&"builder-b".to_string()), vec![2]);
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Builder input pipeline.
//!
//! Three stages connected by bounded queues:
//!
//! 1. The **pacer** consumes admission (`Add`/`Delete`) and fetch (`Info`,
//!    `Failed`) events, rewrites topology TF ids, discards fragments at or
//!    below the last built id, and accumulates per-TF fragment vectors in
//!    the merge map.
//! 2. The **completion** stage watches the lowest outstanding `tf_id`; when
//!    its fragment count reaches the expected number of senders (scheduler
//!    RPC; builder-local for topology TFs) the vector moves to the merge
//!    queue.
//! 3. The **merger** seeds the TimeFrame from the first fragment, folds the
//!    rest in, validates equipment disjointness, releases the reservation,
//!    acks the scheduler and hands the TimeFrame downstream.
//!
//! The merge map sits under one lock, never held across an RPC or data-plane
//! wait.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use tfdist_runtime::model::{SenderId, StfFragment, StfOrigin, TfId, TimeFrame};
use tfdist_runtime::rpc::{SchedulerApi, TfBuilt};

use crate::capacity::BuilderCapacity;

/// Topology TF ids are rewritten into this range, keeping them disjoint from
/// any physics id.
const TOPO_ID_BASE: TfId = 1 << 62;
/// Id space per sender within the topology range.
const TOPO_ID_STRIDE: TfId = 1 << 40;

/// Bounded history of dropped ids; late fragments for them are discarded.
const DROPPED_HISTORY: usize = 4096;

/// Completion re-check period when no event arrives.
const COMPLETION_TICK: Duration = Duration::from_millis(10);

/// Event consumed by the pacer.
pub enum PacerEvent {
    /// A TF was admitted; record the intent to build it.
    Add { tf_id: TfId },
    /// An admission was aborted; forget the intent and discard fragments.
    Delete { tf_id: TfId },
    /// One sender's fragment finished fetching.
    Info(ReceivedStf),
    /// A fetch failed; the whole TF is dropped.
    Failed { tf_id: TfId, sender_id: SenderId },
}

pub struct ReceivedStf {
    pub sender_id: SenderId,
    pub fragment: StfFragment,
    pub received_at: Instant,
}

struct MergeState {
    map: BTreeMap<TfId, Vec<ReceivedStf>>,
    last_built: TfId,
    /// Expected fragment counts for builder-local (topology) ids.
    topo_expected: HashMap<TfId, u32>,
    /// Rewritten id -> the scheduler's id, for reservation release and acks.
    alias: HashMap<TfId, TfId>,
    /// Per-sender topology rewrite counters and sender ordinals.
    topo_counters: HashMap<SenderId, TfId>,
    topo_ordinals: HashMap<SenderId, u64>,
    /// Cached `NumberOfStfs` answers.
    expected_cache: HashMap<TfId, u32>,
    /// Recently dropped ids, bounded.
    dropped: BTreeSet<TfId>,
}

impl MergeState {
    fn mark_dropped(&mut self, tf_id: TfId) {
        self.dropped.insert(tf_id);
        while self.dropped.len() > DROPPED_HISTORY {
            self.dropped.pop_first();
        }
    }

    fn forget(&mut self, tf_id: TfId) {
        self.map.remove(&tf_id);
        self.topo_expected.remove(&tf_id);
        self.expected_cache.remove(&tf_id);
    }

    fn topo_rewrite(&mut self, sender_id: &SenderId) -> TfId {
        let next_ordinal = self.topo_ordinals.len() as u64;
        let ordinal = *self
            .topo_ordinals
            .entry(sender_id.clone())
            .or_insert(next_ordinal);
        let counter = self.topo_counters.entry(sender_id.clone()).or_insert(0);
        *counter += 1;
        TOPO_ID_BASE + ordinal * TOPO_ID_STRIDE + *counter
    }
}

pub struct InputPipeline {
    builder_id: String,
    events_tx: mpsc::Sender<PacerEvent>,
    state: Arc<Mutex<MergeState>>,
    merge_signal: Arc<Notify>,
    capacity: Arc<BuilderCapacity>,
}

impl InputPipeline {
    /// Build the pipeline and start its three stage tasks.
    pub fn start(
        builder_id: String,
        capacity: Arc<BuilderCapacity>,
        scheduler: Arc<dyn SchedulerApi>,
        downstream: mpsc::Sender<TimeFrame>,
        keep_first_empty_part: bool,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let state = Arc::new(Mutex::new(MergeState {
            map: BTreeMap::new(),
            last_built: 0,
            topo_expected: HashMap::new(),
            alias: HashMap::new(),
            topo_counters: HashMap::new(),
            topo_ordinals: HashMap::new(),
            expected_cache: HashMap::new(),
            dropped: BTreeSet::new(),
        }));
        let merge_signal = Arc::new(Notify::new());

        let pipeline = Arc::new(Self {
            builder_id,
            events_tx,
            state: state.clone(),
            merge_signal: merge_signal.clone(),
            capacity: capacity.clone(),
        });

        let (merge_tx, merge_rx) = mpsc::channel(8);

        tokio::spawn(pacer_task(
            events_rx,
            state.clone(),
            merge_signal.clone(),
            capacity.clone(),
            cancel.clone(),
        ));
        tokio::spawn(completion_task(
            state.clone(),
            merge_signal,
            scheduler.clone(),
            merge_tx,
            cancel.clone(),
        ));
        tokio::spawn(merger_task(
            pipeline.builder_id.clone(),
            merge_rx,
            state,
            capacity,
            scheduler,
            downstream,
            keep_first_empty_part,
            cancel,
        ));

        pipeline
    }

    /// Queue handle for the fetch stage.
    pub fn events(&self) -> mpsc::Sender<PacerEvent> {
        self.events_tx.clone()
    }

    /// Record the intent to build an admitted TF.
    pub async fn admit(&self, tf_id: TfId) {
        let _ = self.events_tx.send(PacerEvent::Add { tf_id }).await;
    }

    /// Drop a TF: release the reservation and discard anything buffered,
    /// including partial data. Idempotent.
    pub async fn abort(&self, tf_id: TfId) {
        self.capacity.release(tf_id, None);
        let _ = self.events_tx.send(PacerEvent::Delete { tf_id }).await;
    }

    pub fn last_built(&self) -> TfId {
        self.state.lock().last_built
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().map.len()
    }
}

async fn pacer_task(
    mut events: mpsc::Receiver<PacerEvent>,
    state: Arc<Mutex<MergeState>>,
    merge_signal: Arc<Notify>,
    capacity: Arc<BuilderCapacity>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        match event {
            PacerEvent::Add { tf_id } => {
                let mut state = state.lock();
                if state.map.contains_key(&tf_id) {
                    tracing::error!(tf_id, "build intent already recorded");
                    continue;
                }
                if tf_id <= state.last_built {
                    tracing::error!(
                        tf_id,
                        last_built = state.last_built,
                        "admission at or below the last built TF; refusing intent"
                    );
                    state.mark_dropped(tf_id);
                    continue;
                }
                state.dropped.remove(&tf_id);
                state.map.insert(tf_id, Vec::new());
            }
            PacerEvent::Delete { tf_id } => {
                let mut state = state.lock();
                state.forget(tf_id);
                state.mark_dropped(tf_id);
            }
            PacerEvent::Failed { tf_id, sender_id } => {
                tracing::error!(tf_id, sender_id = %sender_id, "fetch failed; dropping TF");
                capacity.release(tf_id, None);
                let mut state = state.lock();
                state.forget(tf_id);
                state.mark_dropped(tf_id);
            }
            PacerEvent::Info(mut received) => {
                let mut state = state.lock();
                let mut tf_id = received.fragment.header.tf_id;

                if state.dropped.contains(&tf_id) {
                    tracing::debug!(tf_id, "fragment for a dropped TF discarded");
                    continue;
                }

                // topology TFs get a builder-local sequential id
                if received.fragment.header.origin == StfOrigin::Topology {
                    let new_id = state.topo_rewrite(&received.sender_id);
                    tracing::debug!(tf_id, new_id, "topology TF id rewritten");
                    state.forget(tf_id);
                    state.alias.insert(new_id, tf_id);
                    state.topo_expected.insert(new_id, 1);
                    received.fragment.header.tf_id = new_id;
                    tf_id = new_id;
                }

                // duplicate or reordered: discard the newcomer, keep any
                // in-progress merge untouched
                if tf_id <= state.last_built {
                    tracing::error!(
                        sender_id = %received.sender_id,
                        tf_id,
                        last_built = state.last_built,
                        "received fragment at or below the last built TF; discarding"
                    );
                    continue;
                }

                state.map.entry(tf_id).or_default().push(received);
                drop(state);
                merge_signal.notify_one();
            }
        }
    }
    tracing::debug!("pacer exiting");
}

async fn completion_task(
    state: Arc<Mutex<MergeState>>,
    merge_signal: Arc<Notify>,
    scheduler: Arc<dyn SchedulerApi>,
    merge_tx: mpsc::Sender<Vec<ReceivedStf>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = merge_signal.notified() => {}
            _ = tokio::time::sleep(COMPLETION_TICK) => {}
            _ = cancel.cancelled() => break,
        }

        loop {
            // lowest outstanding id first; never hold the lock across the RPC
            let Some((tf_id, have)) = state
                .lock()
                .map
                .iter()
                .next()
                .map(|(id, stfs)| (*id, stfs.len() as u32))
            else {
                break;
            };

            let expected = {
                let state_guard = state.lock();
                state_guard
                    .topo_expected
                    .get(&tf_id)
                    .or_else(|| state_guard.expected_cache.get(&tf_id))
                    .copied()
            };
            let expected = match expected {
                Some(expected) => Some(expected),
                None => match scheduler.number_of_stfs(tf_id).await {
                    Ok(Some(expected)) => {
                        state.lock().expected_cache.insert(tf_id, expected);
                        Some(expected)
                    }
                    Ok(None) => None,
                    Err(err) => {
                        tracing::warn!(tf_id, error = %err, "expected-count query failed");
                        None
                    }
                },
            };

            let Some(expected) = expected else {
                // scheduler has not finished instructing the senders yet
                break;
            };

            if have < expected {
                break;
            }
            if have > expected {
                tracing::error!(tf_id, have, expected, "more fragments than senders");
            }

            let batch = {
                let mut state_guard = state.lock();
                let Some(stfs) = state_guard.map.remove(&tf_id) else {
                    continue; // dropped while we queried
                };
                state_guard.topo_expected.remove(&tf_id);
                state_guard.expected_cache.remove(&tf_id);
                // late duplicates of this id are discarded from here on
                state_guard.last_built = state_guard.last_built.max(tf_id);
                stfs
            };

            if merge_tx.send(batch).await.is_err() {
                return;
            }
        }
    }
    tracing::debug!("completion stage exiting");
}

#[allow(clippy::too_many_arguments)]
async fn merger_task(
    builder_id: String,
    mut merge_rx: mpsc::Receiver<Vec<ReceivedStf>>,
    state: Arc<Mutex<MergeState>>,
    capacity: Arc<BuilderCapacity>,
    scheduler: Arc<dyn SchedulerApi>,
    downstream: mpsc::Sender<TimeFrame>,
    keep_first_empty_part: bool,
    cancel: CancellationToken,
) {
    let mut built_total: u64 = 0;

    loop {
        let batch = tokio::select! {
            batch = merge_rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let mut stfs = batch.into_iter();
        let Some(first) = stfs.next() else {
            continue;
        };
        let first_received = first.received_at;
        let mut last_received = first_received;

        let mut tf = TimeFrame::from_fragment(first.fragment, first.sender_id);
        for received in stfs {
            last_received = last_received.max(received.received_at);
            tf.merge_fragment(received.fragment, &received.sender_id);
        }
        tf.finalize();
        tf.filter_empty_parts(keep_first_empty_part);

        let tf_id = tf.id();
        let size = tf.data_size();
        built_total += 1;

        // reservations and the scheduler record live under the original id
        let report_id = state.lock().alias.remove(&tf_id).unwrap_or(tf_id);
        capacity.release(report_id, Some(size));

        if let Err(err) = scheduler
            .tf_built(TfBuilt {
                builder_id: builder_id.clone(),
                tf_id: report_id,
                size_bytes: size,
            })
            .await
        {
            tracing::warn!(tf_id = report_id, error = %err, "built ack failed");
        }

        let metrics = tfdist_runtime::metrics::pipeline();
        metrics.tfs_built.with_label_values(&[&builder_id]).inc();
        metrics
            .bytes_fetched
            .with_label_values(&[&builder_id])
            .inc_by(size);

        tracing::debug!(
            tf_id,
            size,
            duration_ms = last_received.duration_since(first_received).as_millis() as u64,
            total = built_total,
            "TimeFrame built"
        );

        if downstream.send(tf).await.is_err() {
            tracing::warn!("downstream receiver gone; stopping merger");
            break;
        }
    }
    tracing::debug!("merger exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use tfdist_runtime::Result;
    use tfdist_runtime::model::test_support::fragment;
    use tfdist_runtime::rpc::{
        Heartbeat, PartitionStateReply, StfAnnounce, StfAnnounceStatus, TerminatePartition,
    };

    /// Scheduler stub: serves expected counts and records built acks.
    struct StubScheduler {
        expected: PlMutex<HashMap<TfId, u32>>,
        built: PlMutex<Vec<TfId>>,
    }

    impl StubScheduler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                expected: PlMutex::new(HashMap::new()),
                built: PlMutex::new(Vec::new()),
            })
        }

        fn expect(&self, tf_id: TfId, n: u32) {
            self.expected.lock().insert(tf_id, n);
        }
    }

    #[async_trait]
    impl SchedulerApi for StubScheduler {
        async fn heartbeat(&self, _heartbeat: Heartbeat) -> Result<()> {
            Ok(())
        }
        async fn get_partition_state(&self) -> Result<PartitionStateReply> {
            unimplemented!()
        }
        async fn num_stf_senders(&self) -> Result<u32> {
            Ok(2)
        }
        async fn stf_announce(&self, _announce: StfAnnounce) -> Result<StfAnnounceStatus> {
            unimplemented!()
        }
        async fn number_of_stfs(&self, tf_id: TfId) -> Result<Option<u32>> {
            Ok(self.expected.lock().get(&tf_id).copied())
        }
        async fn terminate_partition(
            &self,
            _req: TerminatePartition,
        ) -> Result<PartitionStateReply> {
            unimplemented!()
        }
        async fn tf_built(&self, built: TfBuilt) -> Result<()> {
            self.built.lock().push(built.tf_id);
            Ok(())
        }
        async fn register_builder(
            &self,
            _req: tfdist_runtime::rpc::RegisterBuilder,
        ) -> Result<tfdist_runtime::rpc::RegisterBuilderReply> {
            unimplemented!()
        }
    }

    fn pipeline_with(
        scheduler: Arc<StubScheduler>,
        capacity: Arc<BuilderCapacity>,
    ) -> (Arc<InputPipeline>, mpsc::Receiver<TimeFrame>) {
        let (downstream_tx, downstream_rx) = mpsc::channel(16);
        let pipeline = InputPipeline::start(
            "builder-01".to_string(),
            capacity,
            scheduler,
            downstream_tx,
            true,
            CancellationToken::new(),
        );
        (pipeline, downstream_rx)
    }

    fn info(sender: &str, fragment: StfFragment) -> PacerEvent {
        PacerEvent::Info(ReceivedStf {
            sender_id: sender.to_string(),
            fragment,
            received_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn test_two_sender_merge() {
        let scheduler = StubScheduler::new();
        let capacity = Arc::new(BuilderCapacity::new(16 << 20));
        let (pipeline, mut downstream) = pipeline_with(scheduler.clone(), capacity.clone());

        capacity.reserve(100, 3 << 10);
        pipeline.admit(100).await;
        scheduler.expect(100, 2);

        let events = pipeline.events();
        events.send(info("sender-a", fragment(100, "TPC", 0, 2, 1024))).await.unwrap();
        events.send(info("sender-b", fragment(100, "ITS", 1, 1, 1024))).await.unwrap();

        let tf = downstream.recv().await.unwrap();
        assert_eq!(tf.id(), 100);
        assert_eq!(tf.data_size(), 3 << 10);
        assert_eq!(tf.equipment_ids().len(), 2);

        // reservation released, scheduler acked
        assert_eq!(capacity.reserved_bytes(), 0);
        assert_eq!(scheduler.built.lock().as_slice(), &[100]);
        assert_eq!(pipeline.last_built(), 100);
    }

    #[tokio::test]
    async fn test_single_sender_no_merge_step() {
        let scheduler = StubScheduler::new();
        let capacity = Arc::new(BuilderCapacity::new(16 << 20));
        let (pipeline, mut downstream) = pipeline_with(scheduler.clone(), capacity.clone());

        capacity.reserve(7, 1024);
        pipeline.admit(7).await;
        scheduler.expect(7, 1);

        pipeline
            .events()
            .send(info("sender-a", fragment(7, "TPC", 0, 1, 1024)))
            .await
            .unwrap();

        let tf = downstream.recv().await.unwrap();
        assert_eq!(tf.id(), 7);
        assert_eq!(tf.contributors().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_fragment_discarded() {
        let scheduler = StubScheduler::new();
        let capacity = Arc::new(BuilderCapacity::new(16 << 20));
        let (pipeline, mut downstream) = pipeline_with(scheduler.clone(), capacity.clone());

        capacity.reserve(10, 1024);
        pipeline.admit(10).await;
        scheduler.expect(10, 1);
        pipeline
            .events()
            .send(info("sender-a", fragment(10, "TPC", 0, 1, 1024)))
            .await
            .unwrap();
        let tf = downstream.recv().await.unwrap();
        assert_eq!(tf.id(), 10);

        // a late fragment with id <= last built is discarded
        capacity.reserve(9, 1024);
        pipeline.admit(9).await;
        scheduler.expect(9, 1);
        pipeline
            .events()
            .send(info("sender-a", fragment(9, "TPC", 0, 1, 1024)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(downstream.try_recv().is_err());
        assert_eq!(pipeline.last_built(), 10);
    }

    #[tokio::test]
    async fn test_abort_discards_partial_data() {
        let scheduler = StubScheduler::new();
        let capacity = Arc::new(BuilderCapacity::new(16 << 20));
        let (pipeline, mut downstream) = pipeline_with(scheduler.clone(), capacity.clone());

        capacity.reserve(20, 2048);
        pipeline.admit(20).await;
        // one of two fragments arrives, then the drop lands
        pipeline
            .events()
            .send(info("sender-a", fragment(20, "TPC", 0, 1, 1024)))
            .await
            .unwrap();
        pipeline.abort(20).await;
        // dropping twice is dropping once
        pipeline.abort(20).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(capacity.reserved_bytes(), 0);
        assert_eq!(pipeline.outstanding(), 0);

        // the second fragment arrives late and is discarded
        pipeline
            .events()
            .send(info("sender-b", fragment(20, "ITS", 1, 1, 1024)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(downstream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_topology_tf_rewritten_and_built() {
        let scheduler = StubScheduler::new();
        let capacity = Arc::new(BuilderCapacity::new(16 << 20));
        let (pipeline, mut downstream) = pipeline_with(scheduler.clone(), capacity.clone());

        capacity.reserve(7, 1024);
        pipeline.admit(7).await;

        let mut topo = fragment(7, "FLP", 3, 1, 256);
        topo.header.origin = StfOrigin::Topology;
        for part in &mut topo.parts {
            part.header.stf.origin = StfOrigin::Topology;
        }
        pipeline.events().send(info("sender-a", topo)).await.unwrap();

        let tf = downstream.recv().await.unwrap();
        assert!(tf.id() >= TOPO_ID_BASE, "id {} not rewritten", tf.id());
        assert_eq!(tf.equipment_ids().len(), 1);

        // the ack and the reservation release use the scheduler's id
        assert_eq!(scheduler.built.lock().as_slice(), &[7]);
        assert_eq!(capacity.reserved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_lowest_id_merges_first() {
        let scheduler = StubScheduler::new();
        let capacity = Arc::new(BuilderCapacity::new(16 << 20));
        let (pipeline, mut downstream) = pipeline_with(scheduler.clone(), capacity.clone());

        for tf_id in [31u64, 30] {
            capacity.reserve(tf_id, 1024);
            pipeline.admit(tf_id).await;
            scheduler.expect(tf_id, 1);
        }
        // 31 completes before 30; both must come out ascending
        pipeline
            .events()
            .send(info("sender-a", fragment(31, "TPC", 0, 1, 64)))
            .await
            .unwrap();
        pipeline
            .events()
            .send(info("sender-a", fragment(30, "TPC", 1, 1, 64)))
            .await
            .unwrap();

        let first = downstream.recv().await.unwrap();
        let second = downstream.recv().await.unwrap();
        assert_eq!(first.id(), 30);
        assert_eq!(second.id(), 31);
    }
}

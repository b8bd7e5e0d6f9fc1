// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end partition scenarios: real scheduler, senders and builders on
//! loopback transports with a shared in-memory discovery store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use tfdist_builder::{BuilderHandle, BuilderService};
use tfdist_runtime::config::DataPlaneMode;
use tfdist_runtime::discovery::MemoryStore;
use tfdist_runtime::model::{
    EquipmentId, FragmentPart, PartHeader, StfFragment, StfHeader, StfOrigin, TimeFrame, now_ms,
};
use tfdist_runtime::rpc::{RpcClient, SchedulerApi, StfAnnounce, StfAnnounceStatus};
use tfdist_runtime::{RuntimeConfig, logging};
use tfdist_scheduler::{SchedulerHandle, SchedulerInstance};
use tfdist_sender::{SenderHandle, SenderService};

const MIB: u64 = 1 << 20;

struct Partition {
    kv: Arc<MemoryStore>,
    scheduler: SchedulerHandle,
    senders: Vec<(SenderHandle, mpsc::Sender<StfFragment>)>,
    builders: Vec<(BuilderHandle, mpsc::Receiver<TimeFrame>)>,
}

fn base_config(partition_id: &str, sender_ids: &[&str]) -> RuntimeConfig {
    RuntimeConfig {
        partition_id: partition_id.to_string(),
        gather_deadline_ms: 500,
        builder_dead_after_ms: 1_500,
        heartbeat_interval_ms: 200,
        discovery_timeout_ms: 15_000,
        drain_grace_ms: 1_000,
        fetch_ack_timeout_ms: 5_000,
        region_size: 32 << 20,
        builder_capacity: 16 << 20,
        max_frame_size: 16 << 20,
        stf_sender_ids: sender_ids.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

async fn start_partition(
    partition_id: &str,
    sender_ids: &[&str],
    builder_capacities: &[u64],
    mode: DataPlaneMode,
    tune: impl Fn(&mut RuntimeConfig),
) -> Partition {
    logging::init();
    let kv = Arc::new(MemoryStore::new());

    // the scheduler publishes its endpoint first, then waits for the sender
    // set; run it concurrently with the sender startups
    let mut scheduler_config = base_config(partition_id, sender_ids);
    scheduler_config.process_id = "scheduler".to_string();
    scheduler_config.data_plane = mode;
    tune(&mut scheduler_config);
    let scheduler_kv = kv.clone();
    let scheduler_task =
        tokio::spawn(async move { SchedulerInstance::start(scheduler_config, scheduler_kv).await });

    let mut senders = Vec::new();
    for sender_id in sender_ids {
        let mut config = base_config(partition_id, sender_ids);
        config.process_id = sender_id.to_string();
        config.data_plane = mode;
        tune(&mut config);
        let (source_tx, source_rx) = mpsc::channel(64);
        let handle = SenderService::start(config, kv.clone(), source_rx)
            .await
            .expect("sender start");
        senders.push((handle, source_tx));
    }

    let scheduler = scheduler_task
        .await
        .expect("scheduler task")
        .expect("scheduler start");

    let mut builders = Vec::new();
    for (index, capacity) in builder_capacities.iter().enumerate() {
        let mut config = base_config(partition_id, sender_ids);
        config.process_id = format!("builder-{index:02}");
        config.data_plane = mode;
        config.builder_capacity = *capacity;
        tune(&mut config);
        let (downstream_tx, downstream_rx) = mpsc::channel(64);
        let handle = BuilderService::start(config, kv.clone(), downstream_tx)
            .await
            .expect("builder start");
        builders.push((handle, downstream_rx));
    }

    Partition {
        kv,
        scheduler,
        senders,
        builders,
    }
}

fn fragment(tf_id: u64, origin: StfOrigin, equipment: (&str, u32), size: u64) -> StfFragment {
    let header = StfHeader {
        tf_id,
        origin,
        run_number: 7,
        first_orbit: 128,
        creation_ms: now_ms(),
    };
    // split into parts of at most 1 MiB
    let mut parts = Vec::new();
    let mut remaining = size;
    let n_parts = size.div_ceil(MIB).max(1);
    for index in 0..n_parts {
        let len = remaining.min(MIB);
        remaining -= len;
        parts.push(FragmentPart {
            header: PartHeader {
                stf: header.clone(),
                equipment: EquipmentId::new(equipment.0, equipment.1),
                split_index: index as u32,
                split_parts: n_parts as u32,
            },
            payload: Bytes::from(vec![0x5A; len as usize]),
        });
    }
    StfFragment::new(header, parts)
}

async fn recv_tf(rx: &mut mpsc::Receiver<TimeFrame>) -> TimeFrame {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a built TimeFrame")
        .expect("downstream closed")
}

/// Poll until `check` passes or the timeout elapses.
async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn happy_path(mode: DataPlaneMode) {
    let mut partition = start_partition(
        &format!("s1-{mode}"),
        &["sender-a", "sender-b"],
        &[16 << 20],
        mode,
        |_| {},
    )
    .await;

    partition.senders[0]
        .1
        .send(fragment(100, StfOrigin::Physics, ("TPC", 0), MIB))
        .await
        .unwrap();
    partition.senders[1]
        .1
        .send(fragment(100, StfOrigin::Physics, ("ITS", 1), 2 * MIB))
        .await
        .unwrap();

    let tf = recv_tf(&mut partition.builders[0].1).await;
    assert_eq!(tf.id(), 100);
    assert_eq!(tf.data_size(), 3 * MIB);
    assert_eq!(
        tf.equipment_ids(),
        vec![EquipmentId::new("ITS", 1), EquipmentId::new("TPC", 0)]
    );

    // reservation released on both sides, sender buffers freed
    let capacity = partition.builders[0].0.capacity.clone();
    assert!(
        eventually(Duration::from_secs(5), || capacity.reserved_bytes() == 0).await,
        "builder reservation not released"
    );
    for (sender, _) in &partition.senders {
        let store = sender.store.clone();
        assert!(
            eventually(Duration::from_secs(5), || store.buffered_bytes() == 0).await,
            "sender buffer not freed"
        );
    }
    assert_eq!(partition.scheduler.instance.counters().0, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_s1_happy_path_rma() {
    happy_path(DataPlaneMode::Rma).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_s1_happy_path_copy_fallback() {
    happy_path(DataPlaneMode::Copy).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_s2_incomplete_tf_times_out() {
    let mut partition = start_partition(
        "s2",
        &["sender-a", "sender-b"],
        &[16 << 20],
        DataPlaneMode::Rma,
        |config| config.gather_deadline_ms = 500,
    )
    .await;

    // only sender-a announces
    partition.senders[0]
        .1
        .send(fragment(101, StfOrigin::Physics, ("TPC", 0), MIB))
        .await
        .unwrap();

    // sender-a's fragment is freed by the drop command
    let store = partition.senders[0].0.store.clone();
    assert!(
        eventually(Duration::from_secs(5), || store.buffered_bytes() == 0).await,
        "fragment not freed after gather timeout"
    );
    let (_, dropped) = partition.scheduler.instance.counters();
    assert!(dropped >= 1);

    // nothing was delivered
    assert!(partition.builders[0].1.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_s3_no_capacity_drops() {
    let mut partition = start_partition(
        "s3",
        &["sender-a", "sender-b"],
        &[4 << 20],
        DataPlaneMode::Rma,
        |_| {},
    )
    .await;

    partition.senders[0]
        .1
        .send(fragment(102, StfOrigin::Physics, ("TPC", 0), 5 * MIB))
        .await
        .unwrap();
    partition.senders[1]
        .1
        .send(fragment(102, StfOrigin::Physics, ("ITS", 1), 5 * MIB))
        .await
        .unwrap();

    for (sender, _) in &partition.senders {
        let store = sender.store.clone();
        assert!(
            eventually(Duration::from_secs(5), || store.buffered_bytes() == 0).await,
            "fragment not freed after no-capacity drop"
        );
    }
    let (built, dropped) = partition.scheduler.instance.counters();
    assert_eq!(built, 0);
    assert!(dropped >= 1);
    assert!(partition.builders[0].1.try_recv().is_err());

    // the builder kept its capacity free
    assert_eq!(partition.builders[0].0.capacity.reserved_bytes(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_s4_builder_death_reaped() {
    let partition = start_partition(
        "s4",
        &["sender-a"],
        &[16 << 20],
        DataPlaneMode::Rma,
        |config| {
            config.heartbeat_interval_ms = 200;
            config.builder_dead_after_ms = 1_000;
        },
    )
    .await;

    let instance = partition.scheduler.instance.clone();
    assert_eq!(instance.builder_count(), 1);

    // the builder dies: heartbeats stop, its RPC endpoint goes away
    partition.builders[0].0.cancel_token().cancel();

    assert!(
        eventually(Duration::from_secs(5), || instance.builder_count() == 0).await,
        "dead builder not reaped"
    );

    // a TF announced now cannot be scheduled; the sender's buffer is freed
    partition.senders[0]
        .1
        .send(fragment(103, StfOrigin::Physics, ("TPC", 0), MIB))
        .await
        .unwrap();
    let store = partition.senders[0].0.store.clone();
    assert!(
        eventually(Duration::from_secs(5), || store.buffered_bytes() == 0).await,
        "fragment not freed after builder death"
    );
    let (_, dropped) = instance.counters();
    assert!(dropped >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_s5_reordered_announcement_refused() {
    let partition = start_partition(
        "s5",
        &["sender-a", "sender-b"],
        &[16 << 20],
        DataPlaneMode::Rma,
        |_| {},
    )
    .await;

    let client = RpcClient::new(partition.scheduler.rpc_endpoint.clone(), 16 << 20);

    let first = client
        .stf_announce(StfAnnounce {
            sender_id: "sender-a".to_string(),
            tf_id: 201,
            size_bytes: 1024,
            origin: StfOrigin::Physics,
        })
        .await
        .unwrap();
    assert_eq!(first, StfAnnounceStatus::Ok);

    // the reordered announcement is refused and dropped on that sender
    let second = client
        .stf_announce(StfAnnounce {
            sender_id: "sender-a".to_string(),
            tf_id: 200,
            size_bytes: 1024,
            origin: StfOrigin::Physics,
        })
        .await
        .unwrap();
    assert_eq!(second, StfAnnounceStatus::DropRunning);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_s6_topology_tf_rewritten() {
    let mut partition = start_partition(
        "s6",
        &["sender-a", "sender-b"],
        &[16 << 20],
        DataPlaneMode::Rma,
        |_| {},
    )
    .await;

    // a topology TF is a one-sender build; sender-b stays silent
    let mut topo = fragment(7, StfOrigin::Topology, ("FLP", 3), 4096);
    topo.header.origin = StfOrigin::Topology;
    partition.senders[0].1.send(topo).await.unwrap();

    let tf = recv_tf(&mut partition.builders[0].1).await;
    assert!(tf.id() >= 1 << 62, "topology id {} not rewritten", tf.id());
    assert_eq!(tf.equipment_ids(), vec![EquipmentId::new("FLP", 3)]);
    assert_eq!(tf.header().origin, StfOrigin::Topology);

    // the scheduler finalized the TF under its original id
    assert_eq!(partition.scheduler.instance.counters().0, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_per_sender_order_preserved() {
    let mut partition = start_partition(
        "order",
        &["sender-a"],
        &[64 << 20],
        DataPlaneMode::Rma,
        |_| {},
    )
    .await;

    for tf_id in 1..=10u64 {
        partition.senders[0]
            .1
            .send(fragment(tf_id, StfOrigin::Physics, ("TPC", 0), 64 << 10))
            .await
            .unwrap();
    }

    // built TFs leave one builder in ascending id order, no duplicates
    for expected in 1..=10u64 {
        let tf = recv_tf(&mut partition.builders[0].1).await;
        assert_eq!(tf.id(), expected);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_partition() {
    let partition = start_partition(
        "terminate",
        &["sender-a"],
        &[16 << 20],
        DataPlaneMode::Rma,
        |_| {},
    )
    .await;

    let client = RpcClient::new(partition.scheduler.rpc_endpoint.clone(), 16 << 20);
    let reply = client
        .terminate_partition(tfdist_runtime::rpc::TerminatePartition {
            partition_id: "terminate".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(
        reply.state,
        tfdist_runtime::PartitionState::Terminating | tfdist_runtime::PartitionState::Terminated
    ));

    let instance = partition.scheduler.instance.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            instance.partition_state() == tfdist_runtime::PartitionState::Terminated
        })
        .await,
        "partition never terminated"
    );

    // discovery record survives until shutdown; new announcements are refused
    let announce = client
        .stf_announce(StfAnnounce {
            sender_id: "sender-a".to_string(),
            tf_id: 1,
            size_bytes: 1024,
            origin: StfOrigin::Physics,
        })
        .await
        .unwrap();
    assert_eq!(announce, StfAnnounceStatus::DropNotRunning);

    let _ = partition.kv;
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-TF buffer.
//!
//! Owns every received fragment until a builder has fetched it or a drop was
//! commanded. Payload bytes live in the registered region so builders can
//! read them one-sidedly; the record keeps the region addresses.
//!
//! Status transitions: `Buffered -> Requested -> Sent` on the happy path,
//! any state `-> Dropped` on command. Terminal transitions free the arena
//! ranges exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use tfdist_runtime::model::{BuilderId, PartHeader, StfFragment, StfHeader, StfOrigin, TfId};
use tfdist_runtime::region::RegionArena;
use tfdist_runtime::{DataError, raise};

/// Lifecycle of one buffered TF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfStatus {
    Buffered,
    Requested,
    Sent,
    Dropped,
}

/// One part as stored in the region.
#[derive(Debug, Clone)]
pub struct StoredPart {
    pub addr: u64,
    pub len: u64,
    pub header: PartHeader,
}

/// Fragment metadata handed to the egress engine; payloads stay in the
/// region until the terminal transition.
#[derive(Debug, Clone)]
pub struct StoredFragment {
    pub header: StfHeader,
    pub parts: Vec<StoredPart>,
}

impl StoredFragment {
    pub fn size_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.len).sum()
    }
}

struct TfRecord {
    status: TfStatus,
    owning_builder: Option<BuilderId>,
    origin: StfOrigin,
    size_bytes: u64,
    /// Taken exactly once, by the terminal transition that frees the parts.
    fragment: Option<StoredFragment>,
}

/// Reason a TF is no longer available to a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SchedulerCommand,
    EgressFailure,
}

/// Outcome of `begin_fetch`.
pub enum FetchOutcome {
    /// The TF is now `Requested` by this builder; serve the fragment.
    Serve(StoredFragment),
    /// The TF was dropped earlier on scheduler command.
    DroppedTimeout,
    /// The TF is unknown (never buffered, already sent, or double-requested).
    Unknown,
}

pub struct SenderStfStore {
    arena: Arc<RegionArena>,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    records: BTreeMap<TfId, TfRecord>,
    /// Bounded tombstone history of dropped ids, for fetch replies.
    dropped: BTreeMap<TfId, DropReason>,
    buffered_bytes: u64,
    sent_total: u64,
    dropped_total: u64,
}

const DROPPED_HISTORY: usize = 4096;

impl SenderStfStore {
    pub fn new(arena: Arc<RegionArena>) -> Self {
        Self {
            arena,
            inner: Mutex::new(StoreInner {
                records: BTreeMap::new(),
                dropped: BTreeMap::new(),
                buffered_bytes: 0,
                sent_total: 0,
                dropped_total: 0,
            }),
        }
    }

    pub fn arena(&self) -> &Arc<RegionArena> {
        &self.arena
    }

    /// Write a fragment's payloads into the region and record the TF as
    /// `Buffered`. Fails when the region cannot hold the fragment; the
    /// caller drops it.
    pub fn insert(&self, fragment: StfFragment) -> tfdist_runtime::Result<StoredFragment> {
        let tf_id = fragment.header.tf_id;
        let mut stored_parts: Vec<StoredPart> = Vec::with_capacity(fragment.parts.len());

        for part in &fragment.parts {
            let len = part.payload.len() as u64;
            let addr = if len == 0 {
                0
            } else {
                match self.arena.alloc(len) {
                    Some(addr) => addr,
                    None => {
                        // roll back what we already placed
                        for placed in stored_parts.iter().filter(|p| p.len > 0) {
                            self.arena.free(placed.addr, placed.len);
                        }
                        raise!("region full: cannot buffer tf {tf_id} ({len} byte part)");
                    }
                }
            };
            if len > 0 {
                self.arena
                    .region()
                    .write(addr, &part.payload)
                    .map_err(|e: DataError| tfdist_runtime::error!("{e}"))?;
            }
            stored_parts.push(StoredPart {
                addr,
                len,
                header: part.header.clone(),
            });
        }

        let stored = StoredFragment {
            header: fragment.header.clone(),
            parts: stored_parts,
        };
        let size_bytes = stored.size_bytes();

        let mut inner = self.inner.lock();
        if inner.records.contains_key(&tf_id) {
            for part in &stored.parts {
                if part.len > 0 {
                    self.arena.free(part.addr, part.len);
                }
            }
            raise!("duplicate tf {tf_id} from readout");
        }
        inner.records.insert(
            tf_id,
            TfRecord {
                status: TfStatus::Buffered,
                owning_builder: None,
                origin: fragment.header.origin,
                size_bytes,
                fragment: Some(stored.clone()),
            },
        );
        inner.buffered_bytes += size_bytes;
        Ok(stored)
    }

    /// Transition `Buffered -> Requested` and hand out the fragment handle.
    pub fn begin_fetch(&self, tf_id: TfId, builder_id: &BuilderId) -> FetchOutcome {
        let mut inner = self.inner.lock();

        if let Some(reason) = inner.dropped.get(&tf_id) {
            return match reason {
                DropReason::SchedulerCommand => FetchOutcome::DroppedTimeout,
                DropReason::EgressFailure => FetchOutcome::Unknown,
            };
        }

        let Some(record) = inner.records.get_mut(&tf_id) else {
            return FetchOutcome::Unknown;
        };
        if record.status != TfStatus::Buffered {
            tracing::error!(tf_id, status = ?record.status, "fetch for a TF that is not buffered");
            return FetchOutcome::Unknown;
        }

        record.status = TfStatus::Requested;
        record.owning_builder = Some(builder_id.clone());
        // clone of the metadata only; payloads stay in the region
        FetchOutcome::Serve(record.fragment.clone().expect("requested TF holds its fragment"))
    }

    /// Terminal transition after the builder's ack: free the parts.
    pub fn complete_sent(&self, tf_id: TfId) {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.records.remove(&tf_id) else {
            return;
        };
        record.status = TfStatus::Sent;
        inner.buffered_bytes = inner.buffered_bytes.saturating_sub(record.size_bytes);
        inner.sent_total += 1;
        drop(inner);
        self.release(record.fragment.take());
    }

    /// Terminal transition on drop command or egress failure. Idempotent.
    /// Returns whether the TF was known.
    pub fn drop_tf(&self, tf_id: TfId, reason: DropReason) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.records.remove(&tf_id) else {
            return false;
        };
        record.status = TfStatus::Dropped;
        inner.buffered_bytes = inner.buffered_bytes.saturating_sub(record.size_bytes);
        inner.dropped_total += 1;
        inner.dropped.insert(tf_id, reason);
        while inner.dropped.len() > DROPPED_HISTORY {
            inner.dropped.pop_first();
        }
        drop(inner);
        self.release(record.fragment.take());
        true
    }

    /// Drop every buffered TF (terminate path).
    pub fn drop_all(&self, reason: DropReason) -> usize {
        let ids: Vec<TfId> = self.inner.lock().records.keys().copied().collect();
        let count = ids.len();
        for tf_id in ids {
            self.drop_tf(tf_id, reason);
        }
        count
    }

    fn release(&self, fragment: Option<StoredFragment>) {
        if let Some(fragment) = fragment {
            for part in &fragment.parts {
                if part.len > 0 {
                    self.arena.free(part.addr, part.len);
                }
            }
        }
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.inner.lock().buffered_bytes
    }

    pub fn buffered_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.sent_total, inner.dropped_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfdist_runtime::model::test_support::fragment;
    use tfdist_runtime::region::RegionRegistry;

    fn store_with(region_size: u64) -> SenderStfStore {
        let registry = RegionRegistry::new();
        let arena = Arc::new(RegionArena::new(registry.register(region_size).unwrap()));
        SenderStfStore::new(arena)
    }

    #[test]
    fn test_insert_and_fetch_lifecycle() {
        let store = store_with(1 << 20);
        store.insert(fragment(100, "TPC", 0, 2, 512)).unwrap();
        assert_eq!(store.buffered_bytes(), 1024);
        assert_eq!(store.buffered_count(), 1);

        let builder = "builder-01".to_string();
        let FetchOutcome::Serve(stored) = store.begin_fetch(100, &builder) else {
            panic!("expected Serve");
        };
        assert_eq!(stored.parts.len(), 2);

        // payload really is in the region
        let bytes = store
            .arena()
            .region()
            .read(stored.parts[0].addr, stored.parts[0].len)
            .unwrap();
        assert_eq!(bytes.len(), 512);

        store.complete_sent(100);
        assert_eq!(store.buffered_bytes(), 0);
        assert_eq!(store.buffered_count(), 0);
        assert_eq!(store.counters(), (1, 0));
        // region space is reusable
        assert_eq!(store.arena().used_bytes(), 0);
    }

    #[test]
    fn test_fetch_unknown_tf() {
        let store = store_with(1 << 20);
        assert!(matches!(
            store.begin_fetch(55, &"builder-01".to_string()),
            FetchOutcome::Unknown
        ));
    }

    #[test]
    fn test_dropped_tf_reports_timeout() {
        let store = store_with(1 << 20);
        store.insert(fragment(100, "TPC", 0, 1, 64)).unwrap();

        assert!(store.drop_tf(100, DropReason::SchedulerCommand));
        // idempotent
        assert!(!store.drop_tf(100, DropReason::SchedulerCommand));

        assert!(matches!(
            store.begin_fetch(100, &"builder-01".to_string()),
            FetchOutcome::DroppedTimeout
        ));
        assert_eq!(store.counters(), (0, 1));
    }

    #[test]
    fn test_double_fetch_is_unknown() {
        let store = store_with(1 << 20);
        store.insert(fragment(100, "TPC", 0, 1, 64)).unwrap();

        let builder = "builder-01".to_string();
        assert!(matches!(store.begin_fetch(100, &builder), FetchOutcome::Serve(_)));
        assert!(matches!(store.begin_fetch(100, &builder), FetchOutcome::Unknown));
    }

    #[test]
    fn test_region_exhaustion_rolls_back() {
        let store = store_with(1024);
        // 2 x 512 fits exactly; a second fragment must fail and leave the
        // arena accounting untouched
        store.insert(fragment(1, "TPC", 0, 2, 512)).unwrap();
        let used = store.arena().used_bytes();
        assert!(store.insert(fragment(2, "TPC", 1, 1, 512)).is_err());
        assert_eq!(store.arena().used_bytes(), used);
    }

    #[test]
    fn test_drop_all() {
        let store = store_with(1 << 20);
        for tf_id in 1..=5 {
            store.insert(fragment(tf_id, "TPC", 0, 1, 64)).unwrap();
        }
        assert_eq!(store.drop_all(DropReason::SchedulerCommand), 5);
        assert_eq!(store.buffered_count(), 0);
        assert_eq!(store.arena().used_bytes(), 0);
    }
}

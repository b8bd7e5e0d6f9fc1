// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registered memory regions.
//!
//! Each process registers the contiguous regions it exposes for one-sided
//! reads. A region gets a process-unique base address in a virtual address
//! space managed by the registry (the registry is the only mapper, so
//! `addr -> region` lookups are unambiguous), a memory token, and an opaque
//! remote key published to peers at connect time.
//!
//! `lookup` is on the egress hot path: every fetched part resolves its
//! region there. The shared region list is copied into a thread-local cache
//! and only re-read when the list generation changes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// Granularity of region base addresses and arena allocations.
const ALIGNMENT: u64 = 64;

/// First virtual base handed out by a registry.
const BASE_ADDR: u64 = 0x1000_0000;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque key a peer must present to read a region. Published at connect
/// time; never guessable from the region token alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteKey {
    pub region: u64,
    nonce: u64,
}

impl RemoteKey {
    pub const WIRE_LEN: usize = 16;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u64(self.region);
        buf.put_u64(self.nonce);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, DataError> {
        if bytes.remaining() != Self::WIRE_LEN {
            return Err(DataError::MalformedHeader(format!(
                "bad remote key length: {}",
                bytes.remaining()
            )));
        }
        Ok(Self {
            region: bytes.get_u64(),
            nonce: bytes.get_u64(),
        })
    }
}

/// One registered region: a contiguous byte range at a fixed virtual base.
pub struct Region {
    token: u64,
    base: u64,
    size: u64,
    nonce: u64,
    data: RwLock<Box<[u8]>>,
}

impl Region {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey {
            region: self.token,
            nonce: self.nonce,
        }
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.base && addr.saturating_add(len) <= self.base + self.size
    }

    /// Copy `len` bytes out of the region at the given virtual address.
    pub fn read(&self, addr: u64, len: u64) -> Result<Bytes, DataError> {
        if !self.contains(addr, len) {
            return Err(DataError::RegionMiss { addr, len });
        }
        let offset = (addr - self.base) as usize;
        let data = self.data.read();
        Ok(Bytes::copy_from_slice(&data[offset..offset + len as usize]))
    }

    /// Write bytes into the region at the given virtual address.
    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), DataError> {
        if !self.contains(addr, bytes.len() as u64) {
            return Err(DataError::RegionMiss {
                addr,
                len: bytes.len() as u64,
            });
        }
        let offset = (addr - self.base) as usize;
        let mut data = self.data.write();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Per-process table of registered regions.
pub struct RegionRegistry {
    id: u64,
    regions: Mutex<Vec<Arc<Region>>>,
    generation: AtomicU64,
    next_base: AtomicU64,
    next_token: AtomicU64,
    nonce_seed: u64,
}

thread_local! {
    static LOOKUP_CACHE: RefCell<HashMap<u64, (u64, Vec<Arc<Region>>)>> =
        RefCell::new(HashMap::new());
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            regions: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            next_base: AtomicU64::new(BASE_ADDR),
            next_token: AtomicU64::new(1),
            nonce_seed: uuid::Uuid::new_v4().as_u64_pair().0,
        }
    }

    /// Register a fresh zero-filled region of `size` bytes.
    pub fn register(&self, size: u64) -> Result<Arc<Region>, DataError> {
        if size == 0 {
            return Err(DataError::MalformedHeader("zero-size region".to_string()));
        }

        let aligned = size.div_ceil(ALIGNMENT) * ALIGNMENT;
        let base = self.next_base.fetch_add(aligned + ALIGNMENT, Ordering::Relaxed);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let region = Arc::new(Region {
            token,
            base,
            size,
            nonce: self.nonce_seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(token),
            data: RwLock::new(vec![0u8; size as usize].into_boxed_slice()),
        });

        self.regions.lock().push(region.clone());
        self.generation.fetch_add(1, Ordering::Release);

        tracing::info!(token, base = format_args!("{base:#x}"), size, "region registered");
        Ok(region)
    }

    /// Find the unique region fully containing `[addr, addr + len)`.
    ///
    /// Serves from the calling thread's cache; the shared list is re-read
    /// only when its generation moved.
    pub fn lookup(&self, addr: u64, len: u64) -> Result<Arc<Region>, DataError> {
        let generation = self.generation.load(Ordering::Acquire);

        LOOKUP_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            let entry = cache.entry(self.id).or_insert_with(|| (u64::MAX, Vec::new()));

            if entry.0 != generation {
                entry.1 = self.regions.lock().clone();
                entry.0 = generation;
            }

            entry
                .1
                .iter()
                .find(|r| r.contains(addr, len))
                .cloned()
                .ok_or(DataError::RegionMiss { addr, len })
        })
    }

    /// Resolve a region by token and validate the presented remote key.
    pub fn verify(&self, key: &RemoteKey) -> Result<Arc<Region>, DataError> {
        let region = self
            .regions
            .lock()
            .iter()
            .find(|r| r.token == key.region)
            .cloned()
            .ok_or(DataError::BadRemoteKey { region: key.region })?;

        if region.remote_key() != *key {
            return Err(DataError::BadRemoteKey { region: key.region });
        }
        Ok(region)
    }

    /// Remote keys of every registered region, for the connect handshake.
    pub fn remote_keys(&self) -> Vec<RemoteKey> {
        self.regions.lock().iter().map(|r| r.remote_key()).collect()
    }

    /// Snapshot of the registered regions.
    pub fn region_list(&self) -> Vec<Arc<Region>> {
        self.regions.lock().clone()
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// First-fit allocator over one registered region.
///
/// Stand-in for the external region allocator: fragments and fetch
/// destinations borrow ranges of the region and return them when the owning
/// TimeFrame reaches a terminal state.
pub struct RegionArena {
    region: Arc<Region>,
    state: Mutex<ArenaState>,
}

struct ArenaState {
    /// Sorted, non-adjacent free ranges as (addr, len).
    free: Vec<(u64, u64)>,
    used_bytes: u64,
}

impl RegionArena {
    pub fn new(region: Arc<Region>) -> Self {
        let free = vec![(region.base(), region.size())];
        Self {
            region,
            state: Mutex::new(ArenaState {
                free,
                used_bytes: 0,
            }),
        }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    /// Allocate `len` bytes; returns the virtual address of the range.
    pub fn alloc(&self, len: u64) -> Option<u64> {
        if len == 0 {
            return None;
        }
        let want = len.div_ceil(ALIGNMENT) * ALIGNMENT;

        let mut state = self.state.lock();
        let slot = state.free.iter().position(|&(_, flen)| flen >= want)?;

        let (addr, flen) = state.free[slot];
        if flen == want {
            state.free.remove(slot);
        } else {
            state.free[slot] = (addr + want, flen - want);
        }
        state.used_bytes += want;
        Some(addr)
    }

    /// Return a range to the free list, coalescing neighbors.
    pub fn free(&self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let want = len.div_ceil(ALIGNMENT) * ALIGNMENT;

        let mut state = self.state.lock();
        state.used_bytes = state.used_bytes.saturating_sub(want);

        let slot = state.free.partition_point(|&(a, _)| a < addr);
        state.free.insert(slot, (addr, want));

        // coalesce with the right neighbor, then the left
        if slot + 1 < state.free.len() {
            let (a, l) = state.free[slot];
            let (na, nl) = state.free[slot + 1];
            if a + l == na {
                state.free[slot] = (a, l + nl);
                state.free.remove(slot + 1);
            }
        }
        if slot > 0 {
            let (pa, pl) = state.free[slot - 1];
            let (a, l) = state.free[slot];
            if pa + pl == a {
                state.free[slot - 1] = (pa, pl + l);
                state.free.remove(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = RegionRegistry::new();
        let region = registry.register(4096).unwrap();

        let found = registry.lookup(region.base(), 4096).unwrap();
        assert_eq!(found.token(), region.token());

        let found = registry.lookup(region.base() + 100, 10).unwrap();
        assert_eq!(found.token(), region.token());

        // range crossing the end of the region does not match
        assert!(registry.lookup(region.base() + 4000, 200).is_err());
        assert!(registry.lookup(0xdead_beef, 1).is_err());
    }

    #[test]
    fn test_lookup_cache_sees_new_registrations() {
        let registry = RegionRegistry::new();
        let first = registry.register(1024).unwrap();
        // warm the thread-local cache
        registry.lookup(first.base(), 1).unwrap();

        let second = registry.register(1024).unwrap();
        let found = registry.lookup(second.base(), 1024).unwrap();
        assert_eq!(found.token(), second.token());
    }

    #[test]
    fn test_read_write_roundtrip() {
        let registry = RegionRegistry::new();
        let region = registry.register(1024).unwrap();

        region.write(region.base() + 64, b"payload").unwrap();
        let bytes = region.read(region.base() + 64, 7).unwrap();
        assert_eq!(&bytes[..], b"payload");
    }

    #[test]
    fn test_remote_key_verification() {
        let registry = RegionRegistry::new();
        let region = registry.register(1024).unwrap();

        let key = region.remote_key();
        assert_eq!(registry.verify(&key).unwrap().token(), region.token());

        let forged = RemoteKey {
            region: region.token(),
            nonce: key.nonce.wrapping_add(1),
        };
        assert!(registry.verify(&forged).is_err());

        let unknown = RemoteKey {
            region: 999,
            nonce: 0,
        };
        assert!(registry.verify(&unknown).is_err());
    }

    #[test]
    fn test_remote_key_wire_roundtrip() {
        let registry = RegionRegistry::new();
        let region = registry.register(64).unwrap();
        let key = region.remote_key();
        assert_eq!(RemoteKey::decode(key.encode()).unwrap(), key);
    }

    #[test]
    fn test_arena_alloc_free_coalesce() {
        let registry = RegionRegistry::new();
        let region = registry.register(1024).unwrap();
        let arena = RegionArena::new(region);

        let a = arena.alloc(100).unwrap();
        let b = arena.alloc(100).unwrap();
        let c = arena.alloc(100).unwrap();
        assert!(a < b && b < c);
        assert_eq!(arena.used_bytes(), 3 * 128);

        arena.free(a, 100);
        arena.free(c, 100);
        arena.free(b, 100);
        assert_eq!(arena.used_bytes(), 0);

        // after full coalescing the whole region is allocatable again
        let all = arena.alloc(1024).unwrap();
        assert_eq!(all, arena.region().base());
    }

    #[test]
    fn test_arena_exhaustion() {
        let registry = RegionRegistry::new();
        let region = registry.register(256).unwrap();
        let arena = RegionArena::new(region);

        assert!(arena.alloc(256).is_some());
        assert!(arena.alloc(1).is_none());
    }
}

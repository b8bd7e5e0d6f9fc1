// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Admission capacity.
//!
//! One counter pair behind one lock: `reserved_bytes` never exceeds
//! `total_bytes`, and always equals the sum of active reservations. A
//! reservation is released exactly once, either by the merger (success) or
//! by a drop.

use std::collections::HashMap;

use parking_lot::Mutex;

use tfdist_runtime::model::TfId;
use tfdist_runtime::rpc::BuilderCapacityInfo;

pub struct BuilderCapacity {
    total_bytes: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    reserved_bytes: u64,
    reservations: HashMap<TfId, u64>,
}

impl BuilderCapacity {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            inner: Mutex::new(Inner {
                reserved_bytes: 0,
                reservations: HashMap::new(),
            }),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Reserve `bytes` for a TF. Refused when it would overcommit the buffer
    /// or the TF already holds a reservation.
    pub fn reserve(&self, tf_id: TfId, bytes: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.reservations.contains_key(&tf_id) {
            tracing::error!(tf_id, "duplicate reservation refused");
            return false;
        }
        if inner.reserved_bytes + bytes > self.total_bytes {
            return false;
        }
        inner.reserved_bytes += bytes;
        inner.reservations.insert(tf_id, bytes);
        true
    }

    /// Release a TF's reservation. Idempotent; returns the reserved amount
    /// when the reservation existed. `actual_bytes` is the fetched size, for
    /// accounting mismatch logs.
    pub fn release(&self, tf_id: TfId, actual_bytes: Option<u64>) -> Option<u64> {
        let mut inner = self.inner.lock();
        let reserved = inner.reservations.remove(&tf_id)?;
        inner.reserved_bytes = inner.reserved_bytes.saturating_sub(reserved);

        if let Some(actual) = actual_bytes {
            if actual != reserved {
                tracing::debug!(
                    tf_id,
                    reserved,
                    actual,
                    "fetched size differs from announced reservation"
                );
            }
        }
        Some(reserved)
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.inner.lock().reserved_bytes
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes - self.reserved_bytes()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().reservations.len()
    }

    pub fn snapshot(&self) -> BuilderCapacityInfo {
        let inner = self.inner.lock();
        BuilderCapacityInfo {
            total_bytes: self.total_bytes,
            reserved_bytes: inner.reserved_bytes,
            free_bytes: self.total_bytes - inner.reserved_bytes,
            in_flight_tfs: inner.reservations.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let capacity = BuilderCapacity::new(16 << 20);
        assert!(capacity.reserve(100, 3 << 20));
        assert_eq!(capacity.reserved_bytes(), 3 << 20);
        assert_eq!(capacity.in_flight(), 1);

        assert_eq!(capacity.release(100, Some(3 << 20)), Some(3 << 20));
        assert_eq!(capacity.reserved_bytes(), 0);
        // idempotent
        assert_eq!(capacity.release(100, None), None);
    }

    #[test]
    fn test_overcommit_refused() {
        let capacity = BuilderCapacity::new(4 << 20);
        assert!(capacity.reserve(1, 3 << 20));
        assert!(!capacity.reserve(2, 2 << 20));
        // a full buffer rejects everything
        let full = BuilderCapacity::new(1024);
        assert!(full.reserve(1, 1024));
        assert!(!full.reserve(2, 1));
        assert_eq!(full.free_bytes(), 0);
    }

    #[test]
    fn test_duplicate_reservation_refused() {
        let capacity = BuilderCapacity::new(16 << 20);
        assert!(capacity.reserve(7, 1024));
        assert!(!capacity.reserve(7, 1024));
        assert_eq!(capacity.reserved_bytes(), 1024);
    }

    #[test]
    fn test_reserved_equals_sum_of_reservations() {
        let capacity = BuilderCapacity::new(1 << 20);
        for tf_id in 0..10u64 {
            assert!(capacity.reserve(tf_id, 1000));
        }
        assert_eq!(capacity.reserved_bytes(), 10_000);
        for tf_id in (0..10u64).step_by(2) {
            capacity.release(tf_id, None);
        }
        assert_eq!(capacity.reserved_bytes(), 5_000);
        assert_eq!(capacity.in_flight(), 5);
    }
}

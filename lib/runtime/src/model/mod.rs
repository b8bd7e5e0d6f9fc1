// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! STF/TF data model.
//!
//! A `StfFragment` is one sender's contribution to one TimeFrame: an ordered
//! list of message parts, each a small header plus an opaque payload. The
//! builder merges all fragments of a TimeFrame id into a [`TimeFrame`].

mod frame;

pub use frame::TimeFrame;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// TimeFrame identifier. Strictly increasing per source.
pub type TfId = u64;

/// Process id of a sender within the partition.
pub type SenderId = String;

/// Process id of a builder within the partition.
pub type BuilderId = String;

/// Sentinel builder id meaning "drop without fetching".
pub const BUILDER_ID_DROP: &str = "-1";

/// Origin tag carried by every fragment.
///
/// `Null` only appears on empty fragments and on a freshly seeded TimeFrame
/// before the first non-empty merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StfOrigin {
    #[default]
    Null,
    Physics,
    Topology,
}

impl std::fmt::Display for StfOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StfOrigin::Null => write!(f, "null"),
            StfOrigin::Physics => write!(f, "physics"),
            StfOrigin::Topology => write!(f, "topology"),
        }
    }
}

/// Identifies one readout endpoint: data origin plus sub-specification.
///
/// Within one TimeFrame the equipment sets contributed by different senders
/// must be disjoint; violations are logged, not fatal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EquipmentId {
    pub origin: String,
    pub sub_spec: u32,
}

impl EquipmentId {
    pub fn new(origin: impl Into<String>, sub_spec: u32) -> Self {
        Self {
            origin: origin.into(),
            sub_spec,
        }
    }
}

impl std::fmt::Display for EquipmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.origin, self.sub_spec)
    }
}

/// Fragment-level header, shared by all parts of one fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StfHeader {
    pub tf_id: TfId,
    pub origin: StfOrigin,
    pub run_number: u64,
    pub first_orbit: u32,
    /// Creation timestamp, milliseconds since the epoch.
    pub creation_ms: u64,
}

/// Per-part header: which equipment produced the payload and how a split
/// payload is indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHeader {
    pub stf: StfHeader,
    pub equipment: EquipmentId,
    pub split_index: u32,
    pub split_parts: u32,
}

/// One message part: header plus opaque payload bytes.
#[derive(Debug, Clone)]
pub struct FragmentPart {
    pub header: PartHeader,
    pub payload: Bytes,
}

/// One sender's contribution to one TimeFrame. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct StfFragment {
    pub header: StfHeader,
    pub parts: Vec<FragmentPart>,
}

impl StfFragment {
    pub fn new(header: StfHeader, parts: Vec<FragmentPart>) -> Self {
        Self { header, parts }
    }

    /// Total payload bytes across all parts.
    pub fn data_size(&self) -> u64 {
        self.parts.iter().map(|p| p.payload.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.data_size() == 0
    }

    /// Equipment identifiers present in this fragment, deduplicated.
    pub fn equipment_ids(&self) -> Vec<EquipmentId> {
        let mut ids: Vec<EquipmentId> = self
            .parts
            .iter()
            .map(|p| p.header.equipment.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fragment constructors shared by unit and component tests.
pub mod test_support {
    use super::*;

    /// Build a single-equipment fragment with `n_parts` payload parts of
    /// `part_len` bytes each.
    pub fn fragment(tf_id: TfId, origin: &str, sub_spec: u32, n_parts: usize, part_len: usize) -> StfFragment {
        let header = StfHeader {
            tf_id,
            origin: StfOrigin::Physics,
            run_number: 42,
            first_orbit: 1000,
            creation_ms: now_ms(),
        };
        let parts = (0..n_parts)
            .map(|i| FragmentPart {
                header: PartHeader {
                    stf: header.clone(),
                    equipment: EquipmentId::new(origin, sub_spec),
                    split_index: i as u32,
                    split_parts: n_parts as u32,
                },
                payload: Bytes::from(vec![0xAB; part_len]),
            })
            .collect();
        StfFragment::new(header, parts)
    }
}

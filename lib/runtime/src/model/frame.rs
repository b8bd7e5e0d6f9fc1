// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Assembled TimeFrame and the fragment merge.

use std::collections::BTreeMap;

use super::{EquipmentId, FragmentPart, SenderId, StfFragment, StfHeader, StfOrigin, TfId, now_ms};

/// A merged TimeFrame: the union of all sender fragments for one `tf_id`,
/// indexed by equipment.
#[derive(Debug, Default)]
pub struct TimeFrame {
    header: StfHeader,
    data: BTreeMap<EquipmentId, Vec<FragmentPart>>,
    contributors: Vec<SenderId>,
}

impl TimeFrame {
    /// Seed a TimeFrame from the first fragment of the merge set.
    pub fn from_fragment(fragment: StfFragment, sender_id: SenderId) -> Self {
        let mut tf = TimeFrame {
            header: fragment.header.clone(),
            data: BTreeMap::new(),
            contributors: Vec::new(),
        };
        tf.insert_parts(fragment.parts);
        tf.contributors.push(sender_id);
        tf
    }

    pub fn id(&self) -> TfId {
        self.header.tf_id
    }

    pub fn header(&self) -> &StfHeader {
        &self.header
    }

    pub fn contributors(&self) -> &[SenderId] {
        &self.contributors
    }

    /// Total payload bytes.
    pub fn data_size(&self) -> u64 {
        self.data
            .values()
            .flatten()
            .map(|p| p.payload.len() as u64)
            .sum()
    }

    pub fn equipment_ids(&self) -> Vec<EquipmentId> {
        self.data.keys().cloned().collect()
    }

    pub fn parts_for(&self, equipment: &EquipmentId) -> Option<&[FragmentPart]> {
        self.data.get(equipment).map(|v| v.as_slice())
    }

    /// Merge another sender's fragment into this TimeFrame.
    ///
    /// Mirrors the established merge rules: an empty null-origin fragment is
    /// a no-op; a null-origin seed adopts the incoming header; origin or
    /// first-orbit mismatches and duplicate equipment are logged, never
    /// fatal. Message parts are moved, not copied.
    pub fn merge_fragment(&mut self, fragment: StfFragment, sender_id: &SenderId) {
        if fragment.header.origin == StfOrigin::Null && fragment.is_empty() {
            return;
        }

        if self.header.origin == StfOrigin::Null {
            self.header = fragment.header.clone();
        }

        if self.header.origin != fragment.header.origin {
            tracing::error!(
                origin = %self.header.origin,
                new_origin = %fragment.header.origin,
                sender_id = %sender_id,
                "merging STFs: origins do not match"
            );
        }

        if self.header.first_orbit != fragment.header.first_orbit {
            tracing::error!(
                first_orbit = self.header.first_orbit,
                new_first_orbit = fragment.header.first_orbit,
                diff = i64::from(fragment.header.first_orbit) - i64::from(self.header.first_orbit),
                sender_id = %sender_id,
                "merging STFs: first orbits do not match"
            );
        }

        for equipment in fragment.equipment_ids() {
            if self.data.contains_key(&equipment) {
                tracing::info!(
                    equipment = %equipment,
                    sender_id = %sender_id,
                    "merging STFs: equipment already present"
                );
            }
        }

        self.insert_parts(fragment.parts);
        self.contributors.push(sender_id.clone());
    }

    /// Re-stamp part headers with the frame-level id, run number and first
    /// orbit, and refresh the creation timestamp. Called once after the last
    /// merge.
    pub fn finalize(&mut self) {
        self.header.creation_ms = now_ms();
        for parts in self.data.values_mut() {
            let split_parts = parts.len() as u32;
            for (index, part) in parts.iter_mut().enumerate() {
                part.header.stf = self.header.clone();
                part.header.split_index = index as u32;
                part.header.split_parts = split_parts;
            }
        }
    }

    /// Drop empty payload parts. When `keep_first` is set, the first part of
    /// each equipment survives regardless of emptiness so the equipment stays
    /// visible downstream.
    pub fn filter_empty_parts(&mut self, keep_first: bool) {
        for parts in self.data.values_mut() {
            let mut index = 0usize;
            parts.retain(|part| {
                let keep = !part.payload.is_empty() || (keep_first && index == 0);
                index += 1;
                keep
            });
        }
    }

    fn insert_parts(&mut self, parts: Vec<FragmentPart>) {
        for part in parts {
            self.data
                .entry(part.header.equipment.clone())
                .or_default()
                .push(part);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::fragment;
    use bytes::Bytes;
    use crate::model::PartHeader;

    fn empty_fragment(tf_id: TfId) -> StfFragment {
        StfFragment::new(
            StfHeader {
                tf_id,
                origin: StfOrigin::Null,
                ..Default::default()
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_merge_two_senders_disjoint_equipment() {
        let mut tf = TimeFrame::from_fragment(fragment(5, "TPC", 0, 2, 64), "sender-a".to_string());
        tf.merge_fragment(fragment(5, "ITS", 1, 1, 32), &"sender-b".to_string());

        assert_eq!(tf.id(), 5);
        assert_eq!(tf.data_size(), 160);
        assert_eq!(
            tf.equipment_ids(),
            vec![EquipmentId::new("ITS", 1), EquipmentId::new("TPC", 0)]
        );
        assert_eq!(tf.contributors().len(), 2);
    }

    #[test]
    fn test_merge_empty_fragment_is_noop() {
        let mut tf = TimeFrame::from_fragment(fragment(5, "TPC", 0, 1, 16), "sender-a".to_string());
        let size = tf.data_size();
        tf.merge_fragment(empty_fragment(5), &"sender-b".to_string());
        assert_eq!(tf.data_size(), size);
        assert_eq!(tf.contributors().len(), 1);
    }

    #[test]
    fn test_null_seed_adopts_incoming_header() {
        let mut tf = TimeFrame::from_fragment(empty_fragment(9), "sender-a".to_string());
        assert_eq!(tf.header().origin, StfOrigin::Null);

        tf.merge_fragment(fragment(9, "TPC", 3, 1, 8), &"sender-b".to_string());
        assert_eq!(tf.header().origin, StfOrigin::Physics);
        assert_eq!(tf.header().run_number, 42);
    }

    #[test]
    fn test_finalize_restamps_parts() {
        let mut tf = TimeFrame::from_fragment(fragment(5, "TPC", 0, 3, 8), "sender-a".to_string());
        tf.finalize();

        let parts = tf.parts_for(&EquipmentId::new("TPC", 0)).unwrap();
        assert_eq!(parts.len(), 3);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.header.stf.tf_id, 5);
            assert_eq!(part.header.split_index, i as u32);
            assert_eq!(part.header.split_parts, 3);
        }
    }

    #[test]
    fn test_filter_empty_parts_keeps_first() {
        let mut frag = fragment(5, "TPC", 0, 3, 8);
        frag.parts[0].payload = Bytes::new();
        frag.parts[2].payload = Bytes::new();
        let mut tf = TimeFrame::from_fragment(frag, "sender-a".to_string());

        tf.filter_empty_parts(true);
        let parts = tf.parts_for(&EquipmentId::new("TPC", 0)).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].payload.is_empty());

        tf.filter_empty_parts(false);
        let parts = tf.parts_for(&EquipmentId::new("TPC", 0)).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(!parts[0].payload.is_empty());
    }

    #[test]
    fn test_duplicate_equipment_is_merged_not_dropped() {
        let mut tf = TimeFrame::from_fragment(fragment(5, "TPC", 0, 1, 16), "sender-a".to_string());
        tf.merge_fragment(fragment(5, "TPC", 0, 1, 16), &"sender-b".to_string());

        // duplicates are logged but both parts are kept
        let parts = tf.parts_for(&EquipmentId::new("TPC", 0)).unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_part_header_roundtrip_serde() {
        let frag = fragment(11, "EMC", 2, 1, 4);
        let header: &PartHeader = &frag.parts[0].header;
        let json = serde_json::to_string(header).unwrap();
        let back: PartHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(*header, back);
    }
}

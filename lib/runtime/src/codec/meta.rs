// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TF metadata header wire format.
//!
//! Sent by a sender under [`super::tag::META`] before a builder fetches the
//! fragment parts:
//!
//! ```text
//! u64 tf_id
//! u32 part_count
//! u64 total_bytes
//! part_count x {
//!   u64 remote_addr
//!   u64 length
//!   u32 header_len
//!   bytes[header_len]
//! }
//! ```
//!
//! All integers big-endian. `header_bytes` is opaque at this layer; the
//! pipeline stores a JSON-encoded part header in it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DataError;

/// Describes one fetchable part: where it lives in the remote region and the
/// small header bytes describing its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    pub remote_addr: u64,
    pub length: u64,
    pub header: Bytes,
}

/// The metadata header for one TimeFrame fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TfMetaHeader {
    pub tf_id: u64,
    pub total_bytes: u64,
    pub parts: Vec<PartDescriptor>,
}

impl TfMetaHeader {
    pub fn encode(&self) -> Bytes {
        let mut size = 8 + 4 + 8;
        for part in &self.parts {
            size += 8 + 8 + 4 + part.header.len();
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u64(self.tf_id);
        buf.put_u32(self.parts.len() as u32);
        buf.put_u64(self.total_bytes);
        for part in &self.parts {
            buf.put_u64(part.remote_addr);
            buf.put_u64(part.length);
            buf.put_u32(part.header.len() as u32);
            buf.put_slice(&part.header);
        }
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, DataError> {
        if bytes.remaining() < 8 + 4 + 8 {
            return Err(DataError::MalformedHeader(format!(
                "short metadata header: {} bytes",
                bytes.remaining()
            )));
        }

        let tf_id = bytes.get_u64();
        let part_count = bytes.get_u32() as usize;
        let total_bytes = bytes.get_u64();

        let mut parts = Vec::with_capacity(part_count.min(4096));
        for index in 0..part_count {
            if bytes.remaining() < 8 + 8 + 4 {
                return Err(DataError::MalformedHeader(format!(
                    "truncated part descriptor {index}/{part_count}"
                )));
            }
            let remote_addr = bytes.get_u64();
            let length = bytes.get_u64();
            let header_len = bytes.get_u32() as usize;
            if bytes.remaining() < header_len {
                return Err(DataError::MalformedHeader(format!(
                    "truncated part header {index}: want {header_len}, have {}",
                    bytes.remaining()
                )));
            }
            let header = bytes.split_to(header_len);
            parts.push(PartDescriptor {
                remote_addr,
                length,
                header,
            });
        }

        if bytes.has_remaining() {
            return Err(DataError::MalformedHeader(format!(
                "{} trailing bytes after {part_count} parts",
                bytes.remaining()
            )));
        }

        Ok(Self {
            tf_id,
            total_bytes,
            parts,
        })
    }
}

/// Fetch outcome reported back to the sender under [`super::tag::DONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfFetchStatus {
    Ok,
    Error,
}

/// Completion ack: `{ tf_id, bytes_fetched, status }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TfDone {
    pub tf_id: u64,
    pub bytes_fetched: u64,
    pub status: TfFetchStatus,
}

impl TfDone {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 8 + 4);
        buf.put_u64(self.tf_id);
        buf.put_u64(self.bytes_fetched);
        buf.put_u32(match self.status {
            TfFetchStatus::Ok => 0,
            TfFetchStatus::Error => 1,
        });
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, DataError> {
        if bytes.remaining() != 8 + 8 + 4 {
            return Err(DataError::MalformedHeader(format!(
                "bad TF done length: {}",
                bytes.remaining()
            )));
        }
        let tf_id = bytes.get_u64();
        let bytes_fetched = bytes.get_u64();
        let status = match bytes.get_u32() {
            0 => TfFetchStatus::Ok,
            _ => TfFetchStatus::Error,
        };
        Ok(Self {
            tf_id,
            bytes_fetched,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rstest::rstest;

    fn header_with_parts(part_count: usize) -> TfMetaHeader {
        let mut rng = rand::rng();
        let parts: Vec<PartDescriptor> = (0..part_count)
            .map(|i| PartDescriptor {
                remote_addr: rng.random::<u64>(),
                length: rng.random_range(0..1 << 30),
                header: Bytes::from(vec![i as u8; rng.random_range(0..64)]),
            })
            .collect();
        let total_bytes = parts.iter().map(|p| p.length).sum();
        TfMetaHeader {
            tf_id: rng.random::<u64>(),
            total_bytes,
            parts,
        }
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(4095)]
    #[case(4096)]
    fn test_roundtrip_boundary_part_counts(#[case] part_count: usize) {
        let header = header_with_parts(part_count);
        let decoded = TfMetaHeader::decode(header.encode()).unwrap();
        assert_eq!(decoded, header, "part_count={part_count}");
    }

    #[test]
    fn test_roundtrip_sampled_part_counts() {
        let mut rng = rand::rng();
        for _ in 0..32 {
            let part_count = rng.random_range(0..=4096);
            let header = header_with_parts(part_count);
            let decoded = TfMetaHeader::decode(header.encode()).unwrap();
            assert_eq!(decoded, header, "part_count={part_count}");
        }
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let header = header_with_parts(3);
        let encoded = header.encode();
        for cut in [0, 1, encoded.len() / 2, encoded.len() - 1] {
            assert!(TfMetaHeader::decode(encoded.slice(..cut)).is_err(), "cut={cut}");
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let header = header_with_parts(1);
        let mut encoded = BytesMut::from(&header.encode()[..]);
        encoded.put_u8(0);
        assert!(TfMetaHeader::decode(encoded.freeze()).is_err());
    }

    #[test]
    fn test_tf_done_roundtrip() {
        let done = TfDone {
            tf_id: 77,
            bytes_fetched: 3 << 20,
            status: TfFetchStatus::Ok,
        };
        assert_eq!(TfDone::decode(done.encode()).unwrap(), done);

        let err = TfDone {
            tf_id: 78,
            bytes_fetched: 0,
            status: TfFetchStatus::Error,
        };
        assert_eq!(TfDone::decode(err.encode()).unwrap(), err);
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire codecs.
//!
//! Everything on the data-plane connection is a tagged frame:
//!
//! ```text
//! tag: u64 (big-endian) | len: u32 (big-endian) | len bytes
//! ```
//!
//! Tags identify the logical channel; frames with the same tag between one
//! peer pair are FIFO. The TF metadata header payload format lives in
//! [`meta`].

mod meta;

pub use meta::{PartDescriptor, TfDone, TfFetchStatus, TfMetaHeader};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Reserved tags. `DATA` carries one-sided read traffic (or inline payloads
/// on the copy fallback); actual values are part of the deployment contract.
pub mod tag {
    /// TF metadata header, sender -> builder.
    pub const META: u64 = 1;
    /// Data channel: RMA get requests/responses, or inline copy payloads.
    pub const DATA: u64 = 2;
    /// Small string messages (endpoint exchange).
    pub const STRING: u64 = 3;
    /// Length prefix for `STRING`.
    pub const STRING_SIZE: u64 = 4;
    /// TF completion ack, builder -> sender.
    pub const DONE: u64 = 1_000_000_000;
}

/// One tagged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFrame {
    pub tag: u64,
    pub payload: Bytes,
}

impl TagFrame {
    pub fn new(tag: u64, payload: Bytes) -> Self {
        Self { tag, payload }
    }
}

/// Codec for tagged frames with a maximum-size guard.
#[derive(Debug, Clone)]
pub struct TagFrameCodec {
    max_frame_size: usize,
}

impl TagFrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for TagFrameCodec {
    fn default() -> Self {
        Self::new(64 << 20)
    }
}

const FRAME_HEADER_LEN: usize = 8 + 4;

impl Decoder for TagFrameCodec {
    type Item = TagFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut peek = &src[..FRAME_HEADER_LEN];
        let tag = peek.get_u64();
        let len = peek.get_u32() as usize;

        if len > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes (max: {})", len, self.max_frame_size),
            ));
        }

        if src.len() < FRAME_HEADER_LEN + len {
            // reserve so the next read can complete the frame in one go
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(TagFrame { tag, payload }))
    }
}

impl Encoder<TagFrame> for TagFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: TagFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "frame too large: {} bytes (max: {})",
                    item.payload.len(),
                    self.max_frame_size
                ),
            ));
        }

        dst.reserve(FRAME_HEADER_LEN + item.payload.len());
        dst.put_u64(item.tag);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = TagFrameCodec::default();
        let mut buf = BytesMut::new();

        let frame = TagFrame::new(tag::META, Bytes::from_static(b"hello"));
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut codec = TagFrameCodec::default();
        let mut buf = BytesMut::new();

        codec
            .encode(TagFrame::new(tag::DONE, Bytes::from(vec![7u8; 32])), &mut buf)
            .unwrap();

        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // completing the frame decodes it
        partial.extend_from_slice(&buf[buf.len() - 1..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.tag, tag::DONE);
        assert_eq!(frame.payload.len(), 32);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = TagFrameCodec::default();
        let mut buf = BytesMut::new();

        codec
            .encode(TagFrame::new(1, Bytes::from_static(b"a")), &mut buf)
            .unwrap();
        codec
            .encode(TagFrame::new(2, Bytes::from_static(b"bb")), &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().tag, 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().tag, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = TagFrameCodec::new(16);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(TagFrame::new(1, Bytes::from(vec![0u8; 17])), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = TagFrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(TagFrame::new(tag::STRING_SIZE, Bytes::new()), &mut buf)
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.payload.is_empty());
    }
}

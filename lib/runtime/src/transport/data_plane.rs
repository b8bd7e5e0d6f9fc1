// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Polymorphic data plane.
//!
//! The builder's fetch stage is generic over how part payloads cross the
//! wire. [`RmaDataPlane`] issues one-sided reads into a pre-registered local
//! region, throttled by the per-sender permit set. [`CopyDataPlane`] reads
//! the payloads the sender pushed inline after the metadata header; the
//! frames of one TimeFrame are consumed as one FIFO unit.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::rma::RmaClient;
use super::{Connection, DataPlaneError};
use crate::codec::{TfMetaHeader, tag};
use crate::error::{DataError, TransportError};
use crate::region::{RegionArena, RemoteKey};

/// A peer's registered region as published at connect time: virtual bounds
/// plus the remote key needed to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegion {
    pub base: u64,
    pub size: u64,
    pub key: RemoteKey,
}

impl RemoteRegion {
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.base && addr.saturating_add(len) <= self.base + self.size
    }
}

/// Fetches the payload of every part named by a metadata header.
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Returns payloads in part order. Any failure aborts the whole fetch;
    /// there are no data-path retries.
    async fn fetch_parts(&self, meta: &TfMetaHeader) -> Result<Vec<Bytes>, DataPlaneError>;
}

/// One-sided read flavor.
pub struct RmaDataPlane {
    client: Arc<RmaClient>,
    remote_regions: Vec<RemoteRegion>,
    /// Bounds in-flight gets towards this sender.
    permits: Arc<Semaphore>,
    /// Local pre-registered destination region.
    arena: Arc<RegionArena>,
}

impl RmaDataPlane {
    pub fn new(
        conn: Arc<Connection>,
        remote_regions: Vec<RemoteRegion>,
        max_in_flight: usize,
        arena: Arc<RegionArena>,
    ) -> Self {
        Self {
            client: RmaClient::new(conn),
            remote_regions,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            arena,
        }
    }

    fn key_for(&self, addr: u64, len: u64) -> Result<RemoteKey, DataError> {
        self.remote_regions
            .iter()
            .find(|r| r.contains(addr, len))
            .map(|r| r.key)
            .ok_or(DataError::RegionMiss { addr, len })
    }
}

#[async_trait]
impl DataPlane for RmaDataPlane {
    async fn fetch_parts(&self, meta: &TfMetaHeader) -> Result<Vec<Bytes>, DataPlaneError> {
        let gets = meta.parts.iter().map(|part| {
            let client = self.client.clone();
            let permits = self.permits.clone();
            let arena = self.arena.clone();
            let key = self.key_for(part.remote_addr, part.length);
            let (addr, len) = (part.remote_addr, part.length);

            async move {
                let key = key?;
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| TransportError::Fatal("fetch permits closed".into()))?;

                if len == 0 {
                    return Ok(Bytes::new());
                }

                let data = client.get(addr, len, key).await?;

                // land the bytes in the pre-registered region; the part
                // payload handed on is a view of that landing buffer
                let dest = arena.alloc(len).ok_or(DataError::RegionMiss {
                    addr: 0,
                    len,
                })?;
                arena.region().write(dest, &data)?;
                let payload = arena.region().read(dest, len)?;
                arena.free(dest, len);

                Ok::<Bytes, DataPlaneError>(payload)
            }
        });

        futures::future::try_join_all(gets).await
    }
}

/// Copy fallback: payloads arrive inline under `DATA`, in part order,
/// immediately after the metadata header.
pub struct CopyDataPlane {
    conn: Arc<Connection>,
    /// One TimeFrame's frames are consumed atomically with respect to other
    /// fetches on this connection.
    serial: tokio::sync::Mutex<()>,
}

impl CopyDataPlane {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            serial: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl DataPlane for CopyDataPlane {
    async fn fetch_parts(&self, meta: &TfMetaHeader) -> Result<Vec<Bytes>, DataPlaneError> {
        let _serial = self.serial.lock().await;

        // consume every announced frame even after a mismatch, so the
        // connection stays aligned for the next TimeFrame
        let mut mismatch = None;
        let mut payloads = Vec::with_capacity(meta.parts.len());
        for part in &meta.parts {
            let payload = self.conn.recv_tagged(tag::DATA).await?;
            if payload.len() as u64 != part.length && mismatch.is_none() {
                mismatch = Some(DataError::SizeMismatch {
                    tf_id: meta.tf_id,
                    announced: part.length,
                    fetched: payload.len() as u64,
                });
            }
            payloads.push(payload);
        }

        match mismatch {
            Some(err) => Err(err.into()),
            None => Ok(payloads),
        }
    }
}

/// Sender-side half of the copy fallback: push the payloads inline after the
/// metadata header, in part order.
pub async fn push_parts_inline(
    conn: &Connection,
    payloads: &[Bytes],
) -> Result<(), TransportError> {
    for payload in payloads {
        conn.send_tagged(tag::DATA, payload.clone()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PartDescriptor;
    use crate::region::RegionRegistry;
    use crate::transport::RegionServer;
    use tokio_util::sync::CancellationToken;

    fn meta_for(parts: &[(u64, Bytes)]) -> TfMetaHeader {
        TfMetaHeader {
            tf_id: 100,
            total_bytes: parts.iter().map(|(_, p)| p.len() as u64).sum(),
            parts: parts
                .iter()
                .map(|(addr, payload)| PartDescriptor {
                    remote_addr: *addr,
                    length: payload.len() as u64,
                    header: Bytes::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_rma_fetch_parts() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let cancel = CancellationToken::new();
        let owner_conn = Connection::spawn(a, "sender", 1 << 20, cancel.clone());
        let reader_conn = Connection::spawn(b, "builder", 1 << 20, cancel.clone());

        // sender side: a region with two parts
        let sender_registry = Arc::new(RegionRegistry::new());
        let region = sender_registry.register(4096).unwrap();
        region.write(region.base(), b"part-zero").unwrap();
        region.write(region.base() + 512, b"part-one!").unwrap();
        let remote = RemoteRegion {
            base: region.base(),
            size: region.size(),
            key: region.remote_key(),
        };

        let server = RegionServer::new(sender_registry);
        tokio::spawn(async move { server.serve(owner_conn, cancel).await });

        // builder side: destination arena
        let builder_registry = RegionRegistry::new();
        let arena = Arc::new(RegionArena::new(builder_registry.register(4096).unwrap()));

        let plane = RmaDataPlane::new(reader_conn, vec![remote], 4, arena);
        let meta = meta_for(&[
            (region.base(), Bytes::from_static(b"part-zero")),
            (region.base() + 512, Bytes::from_static(b"part-one!")),
        ]);

        let payloads = plane.fetch_parts(&meta).await.unwrap();
        assert_eq!(&payloads[0][..], b"part-zero");
        assert_eq!(&payloads[1][..], b"part-one!");
    }

    #[tokio::test]
    async fn test_rma_fetch_unknown_region_fails() {
        let (_a, b) = tokio::io::duplex(1 << 20);
        let cancel = CancellationToken::new();
        let reader_conn = Connection::spawn(b, "builder", 1 << 20, cancel);

        let builder_registry = RegionRegistry::new();
        let arena = Arc::new(RegionArena::new(builder_registry.register(1024).unwrap()));
        let plane = RmaDataPlane::new(reader_conn, Vec::new(), 4, arena);

        let meta = meta_for(&[(0xdead_0000, Bytes::from_static(b"x"))]);
        let err = plane.fetch_parts(&meta).await.unwrap_err();
        assert!(matches!(
            err,
            DataPlaneError::Data(DataError::RegionMiss { .. })
        ));
    }

    #[tokio::test]
    async fn test_copy_fetch_parts() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let cancel = CancellationToken::new();
        let sender_conn = Connection::spawn(a, "sender", 1 << 20, cancel.clone());
        let builder_conn = Connection::spawn(b, "builder", 1 << 20, cancel);

        let parts = [
            (0u64, Bytes::from_static(b"alpha")),
            (0u64, Bytes::from_static(b"beta")),
        ];
        let meta = meta_for(&parts);

        let payloads: Vec<Bytes> = parts.iter().map(|(_, p)| p.clone()).collect();
        tokio::spawn(async move {
            push_parts_inline(&sender_conn, &payloads).await.unwrap();
            // keep the connection alive until the reader is done
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let plane = CopyDataPlane::new(builder_conn);
        let fetched = plane.fetch_parts(&meta).await.unwrap();
        assert_eq!(&fetched[0][..], b"alpha");
        assert_eq!(&fetched[1][..], b"beta");
    }

    #[tokio::test]
    async fn test_copy_fetch_length_mismatch_fails() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let cancel = CancellationToken::new();
        let sender_conn = Connection::spawn(a, "sender", 1 << 20, cancel.clone());
        let builder_conn = Connection::spawn(b, "builder", 1 << 20, cancel);

        let meta = meta_for(&[(0u64, Bytes::from_static(b"expected-len"))]);
        tokio::spawn(async move {
            sender_conn
                .send_tagged(tag::DATA, Bytes::from_static(b"short"))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let plane = CopyDataPlane::new(builder_conn);
        let err = plane.fetch_parts(&meta).await.unwrap_err();
        assert!(matches!(
            err,
            DataPlaneError::Data(DataError::SizeMismatch { .. })
        ));
    }
}

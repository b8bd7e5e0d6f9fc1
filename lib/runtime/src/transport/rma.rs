// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-sided remote reads.
//!
//! The region owner runs a [`RegionServer`] per inbound connection: it
//! answers `GET` frames directly from the region registry, without touching
//! the owner's application logic. The reading side uses an [`RmaClient`]
//! which demultiplexes completions by a caller-supplied token, so any number
//! of gets may be in flight on one connection.
//!
//! The data channel never retries: any failure is surfaced to the caller and
//! drops the owning TimeFrame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{Connection, DataPlaneError};
use crate::codec::tag;
use crate::error::{DataError, TransportError};
use crate::region::{RegionRegistry, RemoteKey};

const GET_REQUEST_LEN: usize = 8 + 8 + 8 + RemoteKey::WIRE_LEN;
const GET_RESPONSE_HEADER_LEN: usize = 8 + 4;

const STATUS_OK: u32 = 0;
const STATUS_BAD_KEY: u32 = 1;
const STATUS_REGION_MISS: u32 = 2;

/// `GET { token, addr, len, key }`, client -> region owner under `DATA`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmaGetRequest {
    pub token: u64,
    pub addr: u64,
    pub len: u64,
    pub key: RemoteKey,
}

impl RmaGetRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(GET_REQUEST_LEN);
        buf.put_u64(self.token);
        buf.put_u64(self.addr);
        buf.put_u64(self.len);
        buf.put_slice(&self.key.encode());
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, DataError> {
        if bytes.remaining() != GET_REQUEST_LEN {
            return Err(DataError::MalformedHeader(format!(
                "bad GET request length: {}",
                bytes.remaining()
            )));
        }
        let token = bytes.get_u64();
        let addr = bytes.get_u64();
        let len = bytes.get_u64();
        let key = RemoteKey::decode(bytes)?;
        Ok(Self {
            token,
            addr,
            len,
            key,
        })
    }
}

fn encode_response(token: u64, status: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(GET_RESPONSE_HEADER_LEN + data.len());
    buf.put_u64(token);
    buf.put_u32(status);
    buf.put_slice(data);
    buf.freeze()
}

fn decode_response(mut bytes: Bytes) -> Result<(u64, u32, Bytes), DataError> {
    if bytes.remaining() < GET_RESPONSE_HEADER_LEN {
        return Err(DataError::MalformedHeader(format!(
            "short GET response: {}",
            bytes.remaining()
        )));
    }
    let token = bytes.get_u64();
    let status = bytes.get_u32();
    Ok((token, status, bytes))
}

/// Serves one-sided reads on one inbound connection.
pub struct RegionServer {
    registry: Arc<RegionRegistry>,
}

impl RegionServer {
    pub fn new(registry: Arc<RegionRegistry>) -> Self {
        Self { registry }
    }

    /// Answer `GET` frames until the connection dies or the token fires.
    /// Spawn one task per connection.
    pub async fn serve(&self, conn: Arc<Connection>, cancel: CancellationToken) {
        loop {
            let payload = tokio::select! {
                payload = conn.recv_tagged(tag::DATA) => payload,
                _ = cancel.cancelled() => break,
            };

            let payload = match payload {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::debug!(peer = conn.peer(), error = %err, "region server: connection gone");
                    break;
                }
            };

            let request = match RmaGetRequest::decode(payload) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(peer = conn.peer(), error = %err, "region server: malformed GET");
                    break;
                }
            };

            let (status, data) = match self.read(&request) {
                Ok(data) => (STATUS_OK, data),
                Err(DataError::BadRemoteKey { .. }) => (STATUS_BAD_KEY, Bytes::new()),
                Err(err) => {
                    tracing::warn!(
                        peer = conn.peer(),
                        addr = format_args!("{:#x}", request.addr),
                        len = request.len,
                        error = %err,
                        "region server: GET failed"
                    );
                    (STATUS_REGION_MISS, Bytes::new())
                }
            };

            let response = encode_response(request.token, status, &data);
            if let Err(err) = conn.send_tagged(tag::DATA, response).await {
                tracing::debug!(peer = conn.peer(), error = %err, "region server: reply failed");
                break;
            }
        }
    }

    fn read(&self, request: &RmaGetRequest) -> Result<Bytes, DataError> {
        let region = self.registry.verify(&request.key)?;
        region.read(request.addr, request.len)
    }
}

/// Issues one-sided reads over one connection, demultiplexing completions by
/// token.
pub struct RmaClient {
    conn: Arc<Connection>,
    pending: Arc<DashMap<u64, oneshot::Sender<(u32, Bytes)>>>,
    next_token: AtomicU64,
}

impl RmaClient {
    /// Wrap a connection and start the completion dispatcher.
    pub fn new(conn: Arc<Connection>) -> Arc<Self> {
        let client = Arc::new(Self {
            conn: conn.clone(),
            pending: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
        });

        let pending = client.pending.clone();
        tokio::spawn(async move {
            loop {
                let payload = match conn.recv_tagged(tag::DATA).await {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::debug!(peer = conn.peer(), error = %err, "rma dispatcher: connection gone");
                        break;
                    }
                };
                match decode_response(payload) {
                    Ok((token, status, data)) => {
                        if let Some((_, tx)) = pending.remove(&token) {
                            let _ = tx.send((status, data));
                        } else {
                            tracing::warn!(token, "rma dispatcher: completion for unknown token");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(peer = conn.peer(), error = %err, "rma dispatcher: malformed completion");
                        break;
                    }
                }
            }
            // fail everything still in flight
            pending.clear();
        });

        client
    }

    /// Read `len` bytes at `addr` from the peer's region identified by `key`.
    pub async fn get(&self, addr: u64, len: u64, key: RemoteKey) -> Result<Bytes, DataPlaneError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token, tx);

        let request = RmaGetRequest {
            token,
            addr,
            len,
            key,
        };
        if let Err(err) = self.conn.send_tagged(tag::DATA, request.encode()).await {
            self.pending.remove(&token);
            return Err(err.into());
        }

        let (status, data) = rx.await.map_err(|_| {
            TransportError::PeerGone(format!("connection to {} is closed", self.conn.peer()))
        })?;

        match status {
            STATUS_OK => {
                if data.len() as u64 != len {
                    return Err(DataError::SizeMismatch {
                        tf_id: 0,
                        announced: len,
                        fetched: data.len() as u64,
                    }
                    .into());
                }
                Ok(data)
            }
            STATUS_BAD_KEY => Err(DataError::BadRemoteKey { region: key.region }.into()),
            _ => Err(DataError::RegionMiss { addr, len }.into()),
        }
    }
}

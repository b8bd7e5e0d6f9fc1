// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Data-plane transport.
//!
//! A [`Connection`] carries tagged frames between one peer pair. Frames with
//! the same tag are FIFO; unrelated tags are independent. A background demux
//! task routes inbound frames into per-tag mailboxes, so concurrent receivers
//! on different tags never contend.
//!
//! On top of the tagged channel sit two data-plane flavors (see
//! [`data_plane`]): one-sided remote reads served by the region owner's
//! [`rma::RegionServer`], and the copy fallback that pushes payload bytes
//! inline. Control messages and the copy fallback may retry at the RPC
//! layer; the data channel never retries.

pub mod data_plane;
pub mod rma;

pub use data_plane::{CopyDataPlane, DataPlane, RemoteRegion, RmaDataPlane};
pub use rma::RegionServer;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{TagFrame, TagFrameCodec, tag};
use crate::error::{DataError, TransportError};

/// Failures surfaced by data-plane operations. `Transport` failures drop the
/// peer; `Data` failures drop only the owning TimeFrame.
#[derive(Debug, thiserror::Error)]
pub enum DataPlaneError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Data(#[from] DataError),
}

type BoxedWrite = WriteHalf<Box<dyn Stream>>;
type BoxedRead = ReadHalf<Box<dyn Stream>>;

/// Anything a connection can run over: TCP in deployments, in-memory duplex
/// pipes in tests.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

struct TagMailbox {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl TagMailbox {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }
}

/// A bidirectional tagged-frame connection to one peer.
///
/// Dropping the connection cancels its demux task, which releases the read
/// half and closes the underlying stream; the peer observes EOF and fails
/// its pending receives with `PeerGone`.
pub struct Connection {
    peer: String,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWrite, TagFrameCodec>>,
    mailboxes: Arc<Mutex<HashMap<u64, Arc<TagMailbox>>>>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    _demux_guard: tokio_util::sync::DropGuard,
}

impl Connection {
    /// Wrap a stream and start the demux task. `peer` is a label for logs
    /// until the handshake names the remote end.
    pub fn spawn(
        stream: impl Stream,
        peer: impl Into<String>,
        max_frame_size: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let peer = peer.into();
        let boxed: Box<dyn Stream> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);

        let conn_token = cancel.child_token();

        let conn = Arc::new(Self {
            peer: peer.clone(),
            writer: tokio::sync::Mutex::new(FramedWrite::new(
                write_half,
                TagFrameCodec::new(max_frame_size),
            )),
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            cancel: conn_token.clone(),
            _demux_guard: conn_token.clone().drop_guard(),
        });

        let reader = FramedRead::new(read_half, TagFrameCodec::new(max_frame_size));
        tokio::spawn(Self::demux_loop(
            reader,
            peer,
            conn.mailboxes.clone(),
            conn.closed.clone(),
            conn_token,
        ));

        conn
    }

    async fn demux_loop(
        mut reader: FramedRead<BoxedRead, TagFrameCodec>,
        peer: String,
        mailboxes: Arc<Mutex<HashMap<u64, Arc<TagMailbox>>>>,
        closed: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                frame = reader.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            let mailbox = Self::mailbox_for(&mailboxes, frame.tag);
                            // receiver side only disappears on close
                            let _ = mailbox.tx.send(frame.payload);
                        }
                        Some(Err(err)) => {
                            tracing::warn!(peer = %peer, error = %err, "connection read failed");
                            break;
                        }
                        None => {
                            tracing::debug!(peer = %peer, "connection closed by peer");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!(peer = %peer, "connection demux cancelled");
                    break;
                }
            }
        }

        closed.store(true, Ordering::Release);
        mailboxes.lock().clear();
        // wakes pending receivers; they observe the closed flag
        cancel.cancel();
    }

    fn mailbox_for(
        mailboxes: &Arc<Mutex<HashMap<u64, Arc<TagMailbox>>>>,
        tag: u64,
    ) -> Arc<TagMailbox> {
        mailboxes
            .lock()
            .entry(tag)
            .or_insert_with(TagMailbox::new)
            .clone()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one frame under `tag`. FIFO with respect to other sends on this
    /// connection.
    pub async fn send_tagged(&self, tag: u64, payload: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::PeerGone(format!(
                "connection to {} is closed",
                self.peer
            )));
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(TagFrame::new(tag, payload))
            .await
            .map_err(TransportError::from)
    }

    /// Receive the next frame with this tag.
    pub async fn recv_tagged(&self, tag: u64) -> Result<Bytes, TransportError> {
        let mailbox = Self::mailbox_for(&self.mailboxes, tag);
        let mut rx = mailbox.rx.lock().await;

        tokio::select! {
            msg = rx.recv() => msg.ok_or_else(|| {
                TransportError::PeerGone(format!("connection to {} is closed", self.peer))
            }),
            _ = self.cancel.cancelled() => {
                if self.is_closed() {
                    Err(TransportError::PeerGone(format!(
                        "connection to {} is closed", self.peer
                    )))
                } else {
                    Err(TransportError::Fatal("worker cancelled".into()))
                }
            }
        }
    }

    /// Send a length-prefixed string (`STRING_SIZE` then `STRING`).
    pub async fn send_string(&self, value: &str) -> Result<(), TransportError> {
        let mut size = BytesMut::with_capacity(8);
        size.put_u64(value.len() as u64);
        self.send_tagged(tag::STRING_SIZE, size.freeze()).await?;
        self.send_tagged(tag::STRING, Bytes::copy_from_slice(value.as_bytes()))
            .await
    }

    /// Receive a length-prefixed string.
    pub async fn recv_string(&self) -> Result<String, TransportError> {
        let mut size = self.recv_tagged(tag::STRING_SIZE).await?;
        if size.remaining() != 8 {
            return Err(TransportError::PeerGone("malformed string size".into()));
        }
        let want = size.get_u64() as usize;

        let payload = self.recv_tagged(tag::STRING).await?;
        if payload.len() != want {
            return Err(TransportError::PeerGone(format!(
                "string length mismatch: announced {want}, received {}",
                payload.len()
            )));
        }
        String::from_utf8(payload.to_vec())
            .map_err(|e| TransportError::PeerGone(format!("string not utf-8: {e}")))
    }

    /// Tear the connection down; pending receivers observe `PeerGone` and the
    /// peer eventually sees EOF.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.mailboxes.lock().clear();
    }
}

/// Dial a peer's data-plane listener over TCP.
pub async fn connect_tcp(
    addr: impl ToSocketAddrs,
    peer: impl Into<String>,
    max_frame_size: usize,
    cancel: CancellationToken,
) -> Result<Arc<Connection>, TransportError> {
    let stream = TcpStream::connect(addr).await.map_err(TransportError::from)?;
    stream.set_nodelay(true).map_err(TransportError::from)?;
    Ok(Connection::spawn(stream, peer, max_frame_size, cancel))
}

/// Accepts inbound data-plane connections.
pub struct DataListener {
    listener: TcpListener,
    local_addr: std::net::SocketAddr,
    max_frame_size: usize,
}

impl DataListener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        max_frame_size: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::from)?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;
        Ok(Self {
            listener,
            local_addr,
            max_frame_size,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Accept one connection. The caller performs the identification
    /// handshake (`recv_string` of the peer id).
    pub async fn accept(&self, cancel: CancellationToken) -> Result<Arc<Connection>, TransportError> {
        let (stream, remote) = self.listener.accept().await.map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        Ok(Connection::spawn(
            stream,
            remote.to_string(),
            self.max_frame_size,
            cancel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let cancel = CancellationToken::new();
        (
            Connection::spawn(a, "peer-a", 1 << 20, cancel.clone()),
            Connection::spawn(b, "peer-b", 1 << 20, cancel),
        )
    }

    #[tokio::test]
    async fn test_send_recv_tagged() {
        let (a, b) = pair();

        a.send_tagged(tag::META, Bytes::from_static(b"meta")).await.unwrap();
        let payload = b.recv_tagged(tag::META).await.unwrap();
        assert_eq!(&payload[..], b"meta");
    }

    #[tokio::test]
    async fn test_tags_are_independent() {
        let (a, b) = pair();

        a.send_tagged(tag::DATA, Bytes::from_static(b"data")).await.unwrap();
        a.send_tagged(tag::META, Bytes::from_static(b"meta")).await.unwrap();

        // receiving META first does not consume the DATA frame
        assert_eq!(&b.recv_tagged(tag::META).await.unwrap()[..], b"meta");
        assert_eq!(&b.recv_tagged(tag::DATA).await.unwrap()[..], b"data");
    }

    #[tokio::test]
    async fn test_fifo_within_tag() {
        let (a, b) = pair();

        for i in 0u8..10 {
            a.send_tagged(tag::DATA, Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0u8..10 {
            assert_eq!(b.recv_tagged(tag::DATA).await.unwrap()[0], i);
        }
    }

    #[tokio::test]
    async fn test_string_roundtrip() {
        let (a, b) = pair();

        a.send_string("sender-epn042").await.unwrap();
        assert_eq!(b.recv_string().await.unwrap(), "sender-epn042");
    }

    #[tokio::test]
    async fn test_peer_drop_wakes_receiver() {
        let (a, b) = pair();

        let recv = tokio::spawn(async move { b.recv_tagged(tag::DONE).await });
        // give the receiver a chance to park
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        drop(a); // drop guard stops a's demux, releasing the duplex endpoint
        let result = recv.await.unwrap();
        assert!(matches!(result, Err(TransportError::PeerGone(_))));
    }

    #[tokio::test]
    async fn test_tcp_listener_accept() {
        let cancel = CancellationToken::new();
        let listener = DataListener::bind("127.0.0.1:0", 1 << 20).await.unwrap();
        let addr = listener.local_addr();

        let client_cancel = cancel.clone();
        let client = tokio::spawn(async move {
            let conn = connect_tcp(addr, "server", 1 << 20, client_cancel).await.unwrap();
            conn.send_string("builder-01").await.unwrap();
            conn
        });

        let server_conn = listener.accept(cancel.clone()).await.unwrap();
        assert_eq!(server_conn.recv_string().await.unwrap(), "builder-01");
        let _client_conn = client.await.unwrap();
    }
}

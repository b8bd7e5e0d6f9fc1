// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Failure taxonomy for the transport and data planes.
//!
//! Consumers match on the category to decide what to do, rather than the
//! error deciding for them: `Transient` failures may be retried on the
//! control channel (bounded attempts), `PeerGone` disconnects the peer and
//! releases its resources, `Data` drops the owning TimeFrame but keeps the
//! peer, and `Fatal` aborts the worker.

use thiserror::Error;

/// Transport-level failures, classified by the action the caller must take.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Recoverable condition (timeout, backpressure). Retry is allowed on
    /// the control channel only; the data channel never retries.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// The peer disconnected or an RMA operation failed. The peer must be
    /// dropped and its reservations released.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// Unrecoverable worker-level failure.
    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the control channel may retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    pub fn is_peer_gone(&self) -> bool {
        matches!(self, TransportError::PeerGone(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused => TransportError::Transient(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => TransportError::PeerGone(err.to_string()),
            _ => TransportError::Fatal(err.to_string()),
        }
    }
}

/// Payload-level failures. These drop the owning TimeFrame, never the peer.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("metadata header malformed: {0}")]
    MalformedHeader(String),

    /// The byte count observed after a fetch does not match the announced one.
    #[error("size mismatch for tf {tf_id}: announced {announced}, fetched {fetched}")]
    SizeMismatch {
        tf_id: u64,
        announced: u64,
        fetched: u64,
    },

    #[error("no registered region contains [{addr:#x}, {addr:#x}+{len})")]
    RegionMiss { addr: u64, len: u64 },

    #[error("remote key rejected for region {region}")]
    BadRemoteKey { region: u64 },
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fetch stage.
//!
//! One listener task per connected sender. The sender pushes a TF metadata
//! header; the listener fetches every part through the connection's data
//! plane (one-sided reads or the copy fallback), reassembles the fragment,
//! acks the sender with DONE and forwards an `Info` event to the pacer.
//!
//! Failure policy (no data-path retries): a payload-level failure drops the
//! TF and keeps the sender; a transport failure drops the TF and the sender
//! connection.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tfdist_runtime::codec::{TfDone, TfFetchStatus, TfMetaHeader, tag};
use tfdist_runtime::model::{
    FragmentPart, PartHeader, SenderId, StfFragment, StfHeader,
};
use tfdist_runtime::transport::{Connection, DataPlane, DataPlaneError};

use crate::input::{PacerEvent, ReceivedStf};

/// One connected sender: its data connection plus the fetch flavor bound to
/// it at handshake time.
pub struct SenderLink {
    pub sender_id: SenderId,
    pub conn: Arc<Connection>,
    pub plane: Arc<dyn DataPlane>,
}

/// Listener loop for one sender connection. Exits when the connection dies,
/// the sender misbehaves, or the token fires.
pub async fn fetch_loop(
    link: Arc<SenderLink>,
    events: mpsc::Sender<PacerEvent>,
    cancel: CancellationToken,
) {
    let sender_id = link.sender_id.clone();
    tracing::debug!(sender_id = %sender_id, "fetch loop started");

    loop {
        let payload = tokio::select! {
            payload = link.conn.recv_tagged(tag::META) => payload,
            _ = cancel.cancelled() => break,
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(sender_id = %sender_id, error = %err, "sender connection lost");
                break;
            }
        };

        let meta = match TfMetaHeader::decode(payload) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::error!(sender_id = %sender_id, error = %err, "malformed metadata header");
                break;
            }
        };
        let tf_id = meta.tf_id;

        match fetch_one(&link, &meta).await {
            Ok(fragment) => {
                let bytes_fetched = fragment.data_size();
                let ack = TfDone {
                    tf_id,
                    bytes_fetched,
                    status: TfFetchStatus::Ok,
                };
                if let Err(err) = link.conn.send_tagged(tag::DONE, ack.encode()).await {
                    tracing::warn!(sender_id = %sender_id, tf_id, error = %err, "DONE ack failed");
                    let _ = events
                        .send(PacerEvent::Failed {
                            tf_id,
                            sender_id: sender_id.clone(),
                        })
                        .await;
                    break;
                }

                let event = PacerEvent::Info(ReceivedStf {
                    sender_id: sender_id.clone(),
                    fragment,
                    received_at: Instant::now(),
                });
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(DataPlaneError::Data(err)) => {
                tracing::error!(sender_id = %sender_id, tf_id, error = %err, "fetch data failure");
                let ack = TfDone {
                    tf_id,
                    bytes_fetched: 0,
                    status: TfFetchStatus::Error,
                };
                let _ = link.conn.send_tagged(tag::DONE, ack.encode()).await;
                let _ = events
                    .send(PacerEvent::Failed {
                        tf_id,
                        sender_id: sender_id.clone(),
                    })
                    .await;
            }
            Err(DataPlaneError::Transport(err)) => {
                tracing::error!(sender_id = %sender_id, tf_id, error = %err, "fetch transport failure");
                let _ = events
                    .send(PacerEvent::Failed {
                        tf_id,
                        sender_id: sender_id.clone(),
                    })
                    .await;
                break;
            }
        }
    }

    link.conn.close();
    tracing::debug!(sender_id = %sender_id, "fetch loop exiting");
}

/// Fetch all parts of one metadata header and reassemble the fragment.
async fn fetch_one(
    link: &SenderLink,
    meta: &TfMetaHeader,
) -> Result<StfFragment, DataPlaneError> {
    let payloads: Vec<Bytes> = link.plane.fetch_parts(meta).await?;

    let mut parts = Vec::with_capacity(meta.parts.len());
    let mut total: u64 = 0;
    for (descriptor, payload) in meta.parts.iter().zip(payloads) {
        let header: PartHeader = serde_json::from_slice(&descriptor.header).map_err(|err| {
            tfdist_runtime::DataError::MalformedHeader(format!(
                "part header for tf {}: {err}",
                meta.tf_id
            ))
        })?;
        total += payload.len() as u64;
        parts.push(FragmentPart { header, payload });
    }

    // declared size mismatch is a data failure: drop the TF, keep the peer
    if total != meta.total_bytes {
        return Err(tfdist_runtime::DataError::SizeMismatch {
            tf_id: meta.tf_id,
            announced: meta.total_bytes,
            fetched: total,
        }
        .into());
    }

    let mut header = parts
        .first()
        .map(|part| part.header.stf.clone())
        .unwrap_or_else(|| StfHeader {
            tf_id: meta.tf_id,
            ..Default::default()
        });
    header.tf_id = meta.tf_id;

    Ok(StfFragment::new(header, parts))
}

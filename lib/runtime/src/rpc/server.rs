// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control RPC server.
//!
//! Accepts connections, reads length-delimited JSON requests and dispatches
//! them to the role's service trait. Requests on one connection are handled
//! in arrival order; responses are written back in the same order.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::messages::*;
use super::{BuilderApi, SchedulerApi, SenderApi};
use crate::{Result, TransportError};

pub(super) fn rpc_codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .max_frame_length(max_frame_size)
        .new_codec()
}

/// Routes requests to the service trait of the hosting role. A process that
/// hosts several roles (tests) may register more than one.
#[derive(Clone, Default)]
pub struct ServiceDispatcher {
    scheduler: Option<Arc<dyn SchedulerApi>>,
    sender: Option<Arc<dyn SenderApi>>,
    builder: Option<Arc<dyn BuilderApi>>,
}

impl ServiceDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scheduler(mut self, api: Arc<dyn SchedulerApi>) -> Self {
        self.scheduler = Some(api);
        self
    }

    pub fn with_sender(mut self, api: Arc<dyn SenderApi>) -> Self {
        self.sender = Some(api);
        self
    }

    pub fn with_builder(mut self, api: Arc<dyn BuilderApi>) -> Self {
        self.builder = Some(api);
        self
    }

    async fn dispatch(&self, request: Request) -> Result<serde_json::Value> {
        match request {
            Request::Ping => to_value(&()),
            Request::Heartbeat(heartbeat) => {
                self.scheduler()?.heartbeat(heartbeat).await?;
                to_value(&())
            }
            Request::GetPartitionState => {
                to_value(&self.scheduler()?.get_partition_state().await?)
            }
            Request::NumStfSenders => to_value(&self.scheduler()?.num_stf_senders().await?),
            Request::StfAnnounce(announce) => {
                to_value(&self.scheduler()?.stf_announce(announce).await?)
            }
            Request::NumberOfStfs { tf_id } => {
                let n = self.scheduler()?.number_of_stfs(tf_id).await?;
                to_value(&NumberOfStfsReply { n })
            }
            Request::TerminatePartition(req) => {
                // every role answers terminate; non-schedulers synthesize the
                // state reply
                if let Some(scheduler) = &self.scheduler {
                    to_value(&scheduler.terminate_partition(req).await?)
                } else if let Some(sender) = &self.sender {
                    sender.terminate(req).await?;
                    to_value(&PartitionStateReply {
                        state: crate::PartitionState::Terminating,
                        message: String::new(),
                    })
                } else {
                    self.builder()?.terminate(req).await?;
                    to_value(&PartitionStateReply {
                        state: crate::PartitionState::Terminating,
                        message: String::new(),
                    })
                }
            }
            Request::TfBuilt(built) => {
                self.scheduler()?.tf_built(built).await?;
                to_value(&())
            }
            Request::RegisterBuilder(req) => {
                to_value(&self.scheduler()?.register_builder(req).await?)
            }
            Request::FetchRequest(fetch) => to_value(&self.sender()?.fetch_request(fetch).await?),
            Request::ConnectBuilder(connect) => {
                to_value(&self.sender()?.connect_builder(connect).await?)
            }
            Request::DisconnectBuilder(disconnect) => {
                to_value(&self.sender()?.disconnect_builder(disconnect).await?)
            }
            Request::BuildInstruction(instruction) => {
                to_value(&self.builder()?.build_instruction(instruction).await?)
            }
            Request::DropTf { tf_id } => {
                self.builder()?.drop_tf(tf_id).await?;
                to_value(&())
            }
        }
    }

    fn scheduler(&self) -> Result<&Arc<dyn SchedulerApi>> {
        self.scheduler
            .as_ref()
            .ok_or_else(|| crate::error!("no scheduler service on this endpoint"))
    }

    fn sender(&self) -> Result<&Arc<dyn SenderApi>> {
        self.sender
            .as_ref()
            .ok_or_else(|| crate::error!("no sender service on this endpoint"))
    }

    fn builder(&self) -> Result<&Arc<dyn BuilderApi>> {
        self.builder
            .as_ref()
            .ok_or_else(|| crate::error!("no builder service on this endpoint"))
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Control RPC endpoint of one process.
pub struct RpcServer {
    listener: TcpListener,
    local_addr: std::net::SocketAddr,
    max_frame_size: usize,
}

impl RpcServer {
    pub async fn bind(addr: impl ToSocketAddrs, max_frame_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error!("rpc server bind failed: {e}"))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            max_frame_size,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Accept loop; runs until cancelled. Spawn this on the runtime.
    pub async fn serve(self, dispatcher: ServiceDispatcher, cancel: CancellationToken) {
        tracing::info!(endpoint = %self.local_addr, "rpc server started");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let dispatcher = dispatcher.clone();
                            let max_frame_size = self.max_frame_size;
                            let conn_cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(err) =
                                    Self::handle_connection(stream, dispatcher, max_frame_size, conn_cancel).await
                                {
                                    tracing::debug!(remote = %remote, error = %err, "rpc connection ended");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "rpc accept failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!(endpoint = %self.local_addr, "rpc server stopped");
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        dispatcher: ServiceDispatcher,
        max_frame_size: usize,
        cancel: CancellationToken,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, rpc_codec(max_frame_size));

        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                _ = cancel.cancelled() => break,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame.freeze(),
                Some(Err(err)) => return Err(TransportError::from(err).into()),
                None => break,
            };

            let response = match serde_json::from_slice::<Request>(&frame) {
                Ok(request) => match dispatcher.dispatch(request).await {
                    Ok(body) => Response::Ok(body),
                    Err(err) => Response::Error(err.to_string()),
                },
                Err(err) => Response::Error(format!("malformed request: {err}")),
            };

            let encoded = serde_json::to_vec(&response)?;
            framed.send(Bytes::from(encoded)).await?;
        }

        Ok(())
    }
}

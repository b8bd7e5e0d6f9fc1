// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control RPC client.
//!
//! One client per remote endpoint. Calls are serialized on the underlying
//! connection; the connection is (re)established lazily, and `Transient`
//! failures are retried with a bounded budget. Application-level errors
//! (`Response::Error`) are never retried.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::messages::*;
use super::server::rpc_codec;
use super::{BuilderApi, SchedulerApi, SenderApi};
use crate::model::TfId;
use crate::{Result, TransportError, raise};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RpcClient {
    endpoint: String,
    max_frame_size: usize,
    timeout: Duration,
    retry_attempts: u32,
    conn: tokio::sync::Mutex<Option<Framed<TcpStream, LengthDelimitedCodec>>>,
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>, max_frame_size: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_frame_size,
            timeout: DEFAULT_TIMEOUT,
            retry_attempts: 3,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Establish the connection if needed. Used by liveness monitors as a
    /// cheap reachability probe.
    pub async fn ensure_connected(&self) -> std::result::Result<(), TransportError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        Ok(())
    }

    /// Round-trip reachability probe; answered by every role.
    pub async fn ping(&self) -> Result<()> {
        self.call(Request::Ping).await
    }

    async fn connect(
        &self,
    ) -> std::result::Result<Framed<TcpStream, LengthDelimitedCodec>, TransportError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| {
                TransportError::Transient(format!("connect to {} timed out", self.endpoint))
            })?
            .map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        Ok(Framed::new(stream, rpc_codec(self.max_frame_size)))
    }

    async fn call_once(
        &self,
        encoded: &[u8],
    ) -> std::result::Result<Response, TransportError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(framed) = guard.as_mut() else {
            return Err(TransportError::Fatal("connection slot empty".into()));
        };

        let exchange = async {
            framed.send(Bytes::copy_from_slice(encoded)).await?;
            match framed.next().await {
                Some(Ok(frame)) => Ok(frame.freeze()),
                Some(Err(err)) => Err(err),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "rpc connection closed",
                )),
            }
        };

        let frame = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                *guard = None;
                return Err(TransportError::from(err));
            }
            Err(_) => {
                *guard = None;
                return Err(TransportError::Transient(format!(
                    "rpc to {} timed out",
                    self.endpoint
                )));
            }
        };

        serde_json::from_slice::<Response>(&frame).map_err(|err| {
            TransportError::PeerGone(format!("malformed rpc response from {}: {err}", self.endpoint))
        })
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let encoded = serde_json::to_vec(&request)?;

        let mut last_err = None;
        for attempt in 0..self.retry_attempts {
            match self.call_once(&encoded).await {
                Ok(Response::Ok(body)) => {
                    return Ok(serde_json::from_value(body)?);
                }
                Ok(Response::Error(message)) => {
                    raise!("rpc error from {}: {message}", self.endpoint);
                }
                Err(err) if err.is_transient() && attempt + 1 < self.retry_attempts => {
                    tracing::debug!(
                        endpoint = %self.endpoint,
                        attempt,
                        error = %err,
                        "transient rpc failure, retrying"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| crate::error!("rpc retry budget exhausted")))
    }
}

#[async_trait::async_trait]
impl SchedulerApi for RpcClient {
    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.call(Request::Heartbeat(heartbeat)).await
    }

    async fn get_partition_state(&self) -> Result<PartitionStateReply> {
        self.call(Request::GetPartitionState).await
    }

    async fn num_stf_senders(&self) -> Result<u32> {
        self.call(Request::NumStfSenders).await
    }

    async fn stf_announce(&self, announce: StfAnnounce) -> Result<StfAnnounceStatus> {
        self.call(Request::StfAnnounce(announce)).await
    }

    async fn number_of_stfs(&self, tf_id: TfId) -> Result<Option<u32>> {
        let reply: NumberOfStfsReply = self.call(Request::NumberOfStfs { tf_id }).await?;
        Ok(reply.n)
    }

    async fn terminate_partition(&self, req: TerminatePartition) -> Result<PartitionStateReply> {
        self.call(Request::TerminatePartition(req)).await
    }

    async fn tf_built(&self, built: TfBuilt) -> Result<()> {
        self.call(Request::TfBuilt(built)).await
    }

    async fn register_builder(&self, req: RegisterBuilder) -> Result<RegisterBuilderReply> {
        self.call(Request::RegisterBuilder(req)).await
    }
}

#[async_trait::async_trait]
impl SenderApi for RpcClient {
    async fn fetch_request(&self, fetch: FetchRequest) -> Result<FetchRequestStatus> {
        self.call(Request::FetchRequest(fetch)).await
    }

    async fn connect_builder(&self, connect: ConnectBuilder) -> Result<ConnectBuilderReply> {
        self.call(Request::ConnectBuilder(connect)).await
    }

    async fn disconnect_builder(
        &self,
        disconnect: DisconnectBuilder,
    ) -> Result<DisconnectBuilderReply> {
        self.call(Request::DisconnectBuilder(disconnect)).await
    }

    async fn terminate(&self, req: TerminatePartition) -> Result<()> {
        let _reply: PartitionStateReply = self.call(Request::TerminatePartition(req)).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BuilderApi for RpcClient {
    async fn build_instruction(
        &self,
        instruction: BuildInstruction,
    ) -> Result<BuildInstructionStatus> {
        self.call(Request::BuildInstruction(instruction)).await
    }

    async fn drop_tf(&self, tf_id: TfId) -> Result<()> {
        self.call(Request::DropTf { tf_id }).await
    }

    async fn terminate(&self, req: TerminatePartition) -> Result<()> {
        let _reply: PartitionStateReply = self.call(Request::TerminatePartition(req)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcServer, ServiceDispatcher};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    struct FakeScheduler {
        announces: AtomicU32,
    }

    #[async_trait]
    impl SchedulerApi for FakeScheduler {
        async fn heartbeat(&self, _heartbeat: Heartbeat) -> Result<()> {
            Ok(())
        }

        async fn get_partition_state(&self) -> Result<PartitionStateReply> {
            Ok(PartitionStateReply {
                state: crate::PartitionState::Configured,
                message: "steady".to_string(),
            })
        }

        async fn num_stf_senders(&self) -> Result<u32> {
            Ok(2)
        }

        async fn stf_announce(&self, announce: StfAnnounce) -> Result<StfAnnounceStatus> {
            self.announces.fetch_add(1, Ordering::Relaxed);
            if announce.tf_id == 666 {
                return Ok(StfAnnounceStatus::DropRunning);
            }
            Ok(StfAnnounceStatus::Ok)
        }

        async fn number_of_stfs(&self, tf_id: TfId) -> Result<Option<u32>> {
            Ok((tf_id == 100).then_some(2))
        }

        async fn terminate_partition(
            &self,
            _req: TerminatePartition,
        ) -> Result<PartitionStateReply> {
            Ok(PartitionStateReply {
                state: crate::PartitionState::Terminating,
                message: "terminate started".to_string(),
            })
        }

        async fn tf_built(&self, _built: TfBuilt) -> Result<()> {
            Ok(())
        }

        async fn register_builder(&self, req: RegisterBuilder) -> Result<RegisterBuilderReply> {
            Ok(RegisterBuilderReply {
                status: ConnectStatus::Ok,
                connected_senders: vec![req.builder_id],
            })
        }
    }

    async fn start_server() -> (String, CancellationToken) {
        let cancel = CancellationToken::new();
        let server = RpcServer::bind("127.0.0.1:0", 1 << 20).await.unwrap();
        let endpoint = server.local_addr().to_string();
        let dispatcher = ServiceDispatcher::new().with_scheduler(Arc::new(FakeScheduler {
            announces: AtomicU32::new(0),
        }));
        tokio::spawn(server.serve(dispatcher, cancel.clone()));
        (endpoint, cancel)
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (endpoint, _cancel) = start_server().await;
        let client = RpcClient::new(endpoint, 1 << 20);

        assert_eq!(client.num_stf_senders().await.unwrap(), 2);

        let state = client.get_partition_state().await.unwrap();
        assert_eq!(state.state, crate::PartitionState::Configured);

        let status = client
            .stf_announce(StfAnnounce {
                sender_id: "sender-a".to_string(),
                tf_id: 1,
                size_bytes: 1024,
                origin: crate::model::StfOrigin::Physics,
            })
            .await
            .unwrap();
        assert_eq!(status, StfAnnounceStatus::Ok);

        let status = client
            .stf_announce(StfAnnounce {
                sender_id: "sender-a".to_string(),
                tf_id: 666,
                size_bytes: 1024,
                origin: crate::model::StfOrigin::Physics,
            })
            .await
            .unwrap();
        assert_eq!(status, StfAnnounceStatus::DropRunning);
    }

    #[tokio::test]
    async fn test_number_of_stfs_pending() {
        let (endpoint, _cancel) = start_server().await;
        let client = RpcClient::new(endpoint, 1 << 20);

        assert_eq!(client.number_of_stfs(100).await.unwrap(), Some(2));
        assert_eq!(client.number_of_stfs(101).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_service_is_application_error() {
        let (endpoint, _cancel) = start_server().await;
        let client = RpcClient::new(endpoint, 1 << 20);

        // this endpoint hosts no sender service
        let err = client
            .fetch_request(FetchRequest {
                tf_id: 1,
                builder_id: "builder-01".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no sender service"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_after_retries() {
        // reserve a port and close it so nothing is listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = RpcClient::new(endpoint, 1 << 20)
            .with_timeout(Duration::from_millis(200))
            .with_retry_attempts(2);
        assert!(client.num_stf_senders().await.is_err());
    }
}

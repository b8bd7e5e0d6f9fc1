// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory key-value store.
//!
//! Backs tests and single-host partitions. Watchers are fed from a
//! broadcast channel; slow watchers that lag behind lose events, which is
//! acceptable for discovery (a fresh `list_prefix` recovers the state).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{KeyValueStore, WatchEvent, WatchStream};
use crate::Result;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Bytes>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            events,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.clone());
        let _ = self.events.send(WatchEvent::Put(key.to_string(), value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.entries.lock().remove(key).is_some() {
            let _ = self.events.send(WatchEvent::Delete(key.to_string()));
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let entries = self.entries.lock();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str, cancel: CancellationToken) -> Result<WatchStream> {
        let mut rx = self.events.subscribe();
        let prefix = prefix.to_string();

        let stream = async_stream::stream! {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Ok(event) => {
                                let key = match &event {
                                    WatchEvent::Put(k, _) => k,
                                    WatchEvent::Delete(k) => k,
                                };
                                if key.starts_with(&prefix) {
                                    yield event;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "watch stream lagged; list to resync");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new();

        assert!(store.get("a").await.unwrap().is_none());
        store.set("a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap(), Bytes::from_static(b"1"));

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_bounds() {
        let store = MemoryStore::new();
        store.set("p/a", Bytes::from_static(b"1")).await.unwrap();
        store.set("p/b", Bytes::from_static(b"2")).await.unwrap();
        store.set("q/a", Bytes::from_static(b"3")).await.unwrap();

        let listed = store.list_prefix("p/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "p/a");
        assert_eq!(listed[1].0, "p/b");
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let mut watch = store.watch_prefix("p/", cancel.clone()).await.unwrap();

        store.set("q/ignored", Bytes::from_static(b"x")).await.unwrap();
        store.set("p/seen", Bytes::from_static(b"y")).await.unwrap();

        let event = watch.next().await.unwrap();
        assert_eq!(
            event,
            WatchEvent::Put("p/seen".to_string(), Bytes::from_static(b"y"))
        );

        store.delete("p/seen").await.unwrap();
        let event = watch.next().await.unwrap();
        assert_eq!(event, WatchEvent::Delete("p/seen".to_string()));

        cancel.cancel();
        assert!(watch.next().await.is_none());
    }
}

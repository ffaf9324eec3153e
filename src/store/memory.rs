//! In-process [`SharedStore`] implementation.
//!
//! Backs the whole core in tests and single-process deployments. Key
//! expiry is lazy: expired entries are treated as absent on read and
//! overwritten on write, so no background sweeper is needed.

use super::SharedStore;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Shared in-memory store with Redis-like semantics.
#[derive(Default)]
pub struct MemoryStore {
    kv: RwLock<HashMap<String, Entry>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    list_notify: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn try_pop(&self, key: &str) -> Option<String> {
        let mut lists = self.lists.lock();
        let queue = lists.get_mut(key)?;
        let value = queue.pop_front();
        if queue.is_empty() {
            lists.remove(key);
        }
        value
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let kv = self.kv.read();
        Ok(kv
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.kv.write().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.kv.write().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut kv = self.kv.write();
        if kv.get(key).is_some_and(|entry| !entry.is_expired()) {
            return Ok(false);
        }
        kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.kv.write().remove(key).is_some())
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let kv = self.kv.read();
        let mut keys: Vec<String> = kv
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn push_list(&self, key: &str, value: &str) -> Result<()> {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.list_notify.notify_waiters();
        Ok(())
    }

    async fn pop_list(&self, key: &str) -> Result<Option<String>> {
        Ok(self.try_pop(key))
    }

    async fn pop_list_timeout(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.list_notify.notified();
            if let Some(value) = self.try_pop(key) {
                return Ok(Some(value));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(self.try_pop(key));
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lists.lock().get(key).map_or(0, VecDeque::len))
    }

    async fn drain_list(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .lists
            .lock()
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hashes.lock().get(key).cloned().unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let sender = self.sender_for(channel);
        // Send errors only mean there are no subscribers, which is fine.
        Ok(sender.send(payload.to_string()).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender_for(channel).subscribe()
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cfg::config::EtcdConfig;

/// What a key change looks like to the directory cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
    /// Lease ran out. etcd v3 reports this as a delete; the in-memory store
    /// keeps the distinction for tests.
    Expire,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
}

/// Keeps a registration lease alive until dropped or cancelled.
///
/// Dropping the guard stops renewal; the key then lapses when its TTL runs
/// out, which is exactly the crash behavior registrations rely on.
#[derive(Debug)]
pub struct LeaseKeepAlive {
    cancel: CancellationToken,
}

impl LeaseKeepAlive {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// A guard with nothing to renew (in-memory backend).
    pub fn noop() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LeaseKeepAlive {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A prefix-watchable key/value store with leased writes: the surface the
/// service directory needs from etcd, kept narrow so tests can run against
/// an in-memory stand-in.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Writes `key = value` under a lease of `ttl`, renewed until the
    /// returned guard is dropped.
    async fn put_with_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LeaseKeepAlive>;

    /// Values of every key under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribes to changes under `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<Box<dyn RegistryWatch>>;
}

/// A live watch subscription.
#[async_trait]
pub trait RegistryWatch: Send {
    /// The next event, or `None` once the subscription ends.
    async fn next_event(&mut self) -> Result<Option<WatchEvent>>;

    /// Cancels the subscription server-side.
    async fn cancel(&mut self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// etcd backend

/// `RegistryStore` over etcd v3.
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connects with the configured endpoint and credentials.
    pub async fn connect(cfg: &EtcdConfig) -> Result<Self> {
        let mut options = ConnectOptions::new();
        if !cfg.username.is_empty() {
            options = options.with_user(cfg.username.clone(), cfg.password.clone());
        }
        let client = Client::connect([cfg.endpoint()], Some(options))
            .await
            .with_context(|| format!("failed to connect etcd at {}", cfg.endpoint()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RegistryStore for EtcdStore {
    async fn put_with_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<LeaseKeepAlive> {
        let mut client = self.client.clone();

        debug!(key, "creating lease");
        let lease = client
            .lease_grant(ttl.as_secs() as i64, None)
            .await
            .context("lease grant failed")?;
        let lease_id = lease.id();

        client
            .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await
            .with_context(|| format!("put {key} failed"))?;

        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease_id)
            .await
            .context("lease keep-alive setup failed")?;

        let cancel = CancellationToken::new();
        let renew_cancel = cancel.clone();
        let renew_key = key.to_string();
        let interval = ttl / 3;
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = renew_cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {},
                }
                if let Err(e) = keeper.keep_alive().await {
                    warn!(key = %renew_key, "lease renewal failed: {e}");
                    return;
                }
                if let Err(e) = responses.message().await {
                    warn!(key = %renew_key, "lease renewal stream failed: {e}");
                    return;
                }
            }
        });

        Ok(LeaseKeepAlive::new(cancel))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .with_context(|| format!("etcd list {prefix} failed"))?;
        let mut values = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            values.push(kv.value_str()?.to_string());
        }
        Ok(values)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(key, None)
            .await
            .with_context(|| format!("etcd delete {key} failed"))?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<Box<dyn RegistryWatch>> {
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .with_context(|| format!("etcd watch {prefix} failed"))?;
        Ok(Box::new(EtcdWatch {
            watcher,
            stream,
            queued: VecDeque::new(),
        }))
    }
}

struct EtcdWatch {
    watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
    queued: VecDeque<WatchEvent>,
}

#[async_trait]
impl RegistryWatch for EtcdWatch {
    async fn next_event(&mut self) -> Result<Option<WatchEvent>> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Ok(Some(event));
            }
            let Some(resp) = self.stream.message().await? else {
                return Ok(None);
            };
            for event in resp.events() {
                let kind = match event.event_type() {
                    EventType::Put => WatchEventKind::Put,
                    EventType::Delete => WatchEventKind::Delete,
                };
                if let Some(kv) = event.kv() {
                    self.queued.push_back(WatchEvent {
                        kind,
                        key: kv.key_str()?.to_string(),
                    });
                }
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.watcher.cancel().await.context("watch cancel failed")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// in-memory backend

/// In-process `RegistryStore` used by tests and local development; behaves
/// like etcd minus leases (expiry is triggered explicitly).
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Simulates a lease running out: the key vanishes and watchers see an
    /// expire event.
    pub fn expire(&self, key: &str) {
        self.entries.lock().expect("store lock").remove(key);
        let _ = self.events.send(WatchEvent {
            kind: WatchEventKind::Expire,
            key: key.to_string(),
        });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().expect("store lock").contains_key(key)
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn put_with_lease(
        &self,
        key: &str,
        value: &str,
        _ttl: Duration,
    ) -> Result<LeaseKeepAlive> {
        self.entries
            .lock()
            .expect("store lock")
            .insert(key.to_string(), value.to_string());
        let _ = self.events.send(WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
        });
        Ok(LeaseKeepAlive::noop())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().expect("store lock");
        let mut values: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        values.sort();
        Ok(values)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().expect("store lock").remove(key);
        let _ = self.events.send(WatchEvent {
            kind: WatchEventKind::Delete,
            key: key.to_string(),
        });
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<Box<dyn RegistryWatch>> {
        Ok(Box::new(MemoryWatch {
            prefix: prefix.to_string(),
            rx: self.events.subscribe(),
            cancelled: false,
        }))
    }
}

struct MemoryWatch {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
    cancelled: bool,
}

#[async_trait]
impl RegistryWatch for MemoryWatch {
    async fn next_event(&mut self) -> Result<Option<WatchEvent>> {
        loop {
            if self.cancelled {
                return Ok(None);
            }
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => {
                    return Ok(Some(event));
                },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "memory watch lagged");
                    continue;
                },
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.cancelled = true;
        Ok(())
    }
}

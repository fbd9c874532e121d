// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    cfg::config::Config,
    registry::store::{
        EtcdStore, LeaseKeepAlive, RegistryStore, WatchEvent, WatchEventKind,
    },
};

/// Every registration lives under this prefix:
/// `/rocket/service/{name}/{host:port}` with value `host:port`.
pub const SERVICE_PREFIX: &str = "/rocket/service/";

const BUCKET_COUNT: usize = 8;
const LEASE_TTL: Duration = Duration::from_secs(30);

type EndpointMap = HashMap<String, Vec<String>>;

struct Bucket {
    /// Authoritative per-bucket map, mutated under the mutex.
    map: tokio::sync::Mutex<EndpointMap>,
    /// Read-only snapshot republished after every slow-path load; the fast
    /// path reads it without taking the mutex.
    snapshot: ArcSwap<EndpointMap>,
    /// Set by the watcher when something under this bucket changed. Acquire
    /// on the read side pairs with the Release stores below, so a clear flag
    /// guarantees the snapshot it guards is at least as fresh.
    dirty: AtomicBool,
}

impl Bucket {
    fn new() -> Self {
        Self {
            map: tokio::sync::Mutex::new(EndpointMap::new()),
            snapshot: ArcSwap::from_pointee(EndpointMap::new()),
            dirty: AtomicBool::new(false),
        }
    }
}

struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// etcd-backed map from service name to endpoint list, with a sharded
/// in-process cache invalidated by a prefix watch.
///
/// Pass the registry around as an explicit `Arc` dependency of channels and
/// servers; there is deliberately no process-wide instance.
pub struct ServiceRegistry {
    store: Arc<dyn RegistryStore>,
    buckets: Vec<Bucket>,
    keep_alives: Mutex<HashMap<String, LeaseKeepAlive>>,
    watcher: Mutex<Option<WatcherHandle>>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::new()).collect(),
            keep_alives: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Server mode: registers every provided service from the config under a
    /// kept-alive lease. No watcher is started. Registration failures are
    /// logged, not fatal.
    pub async fn init_as_server(
        cfg: &Config,
        store: Arc<dyn RegistryStore>,
    ) -> Arc<Self> {
        let registry = Self::new(store);
        info!("service registry initialized in server mode");

        for service in &cfg.services {
            info!(
                name = %service.name,
                endpoint = %service.endpoint(),
                "registering service"
            );
            if let Err(e) = registry
                .register_service(&service.name, &service.host, service.port)
                .await
            {
                error!(name = %service.name, "failed to register service: {e:#}");
            }
        }
        if cfg.services.is_empty() {
            info!("no services configured for registration");
        }

        registry
    }

    /// Client mode: starts the cache-invalidation watcher on the service
    /// prefix. The watch task runs on the current runtime (the watch stream
    /// is bound to the connection that created it).
    pub async fn init_as_client(store: Arc<dyn RegistryStore>) -> Result<Arc<Self>> {
        let registry = Self::new(store);
        registry.start_watcher().await?;
        info!("service registry initialized in client mode with watcher");
        Ok(registry)
    }

    /// `init_as_server` against the etcd endpoint named in the config.
    pub async fn connect_as_server(cfg: &Config) -> Result<Arc<Self>> {
        let etcd = cfg.etcd.as_ref().context("etcd section missing in config")?;
        let store = Arc::new(EtcdStore::connect(etcd).await?);
        Ok(Self::init_as_server(cfg, store).await)
    }

    /// `init_as_client` against the etcd endpoint named in the config.
    pub async fn connect_as_client(cfg: &Config) -> Result<Arc<Self>> {
        let etcd = cfg.etcd.as_ref().context("etcd section missing in config")?;
        let store = Arc::new(EtcdStore::connect(etcd).await?);
        Self::init_as_client(store).await
    }

    /// Writes `/rocket/service/{name}/{host:port}` under a 30 s lease and
    /// retains the keep-alive for the life of the process.
    pub async fn register_service(
        &self,
        name: &str,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let endpoint = format!("{host}:{port}");
        let key = format!("{SERVICE_PREFIX}{name}/{endpoint}");
        let keep_alive = self.store.put_with_lease(&key, &endpoint, LEASE_TTL).await?;
        self.keep_alives
            .lock()
            .expect("keep alive lock")
            .insert(key, keep_alive);
        debug!(name, endpoint, "service registered");
        Ok(())
    }

    /// Deletes the registration key. The keep-alive entry is dropped
    /// separately on shutdown.
    pub async fn unregister_service(&self, name: &str, endpoint: &str) {
        let key = format!("{SERVICE_PREFIX}{name}/{endpoint}");
        if let Err(e) = self.store.delete(&key).await {
            error!(name, "failed to unregister service: {e:#}");
        }
    }

    /// Resolves a service name to its endpoint list.
    ///
    /// Fast path: when the bucket's dirty flag is clear, the lookup goes to
    /// the lock-free snapshot. Slow path: under the bucket mutex, a miss
    /// loads from the store, the bucket is republished and the dirty flag
    /// cleared. Store errors degrade to an empty list; callers treat that as
    /// "no endpoints".
    pub async fn discover(&self, name: &str) -> Vec<String> {
        let bucket = &self.buckets[bucket_index(name)];

        if !bucket.dirty.load(Ordering::Acquire)
            && let Some(endpoints) = bucket.snapshot.load().get(name)
        {
            return endpoints.clone();
        }

        let mut map = bucket.map.lock().await;
        let endpoints = match map.get(name) {
            Some(endpoints) => endpoints.clone(),
            None => {
                let loaded = self.load_by_key(name).await;
                map.insert(name.to_string(), loaded.clone());
                loaded
            },
        };
        bucket.snapshot.store(Arc::new(map.clone()));
        bucket.dirty.store(false, Ordering::Release);
        endpoints
    }

    async fn load_by_key(&self, name: &str) -> Vec<String> {
        let prefix = format!("{SERVICE_PREFIX}{name}");
        match self.store.list(&prefix).await {
            Ok(endpoints) => {
                if endpoints.is_empty() {
                    error!(name, "service not found in the directory");
                } else {
                    debug!(name, count = endpoints.len(), "loaded endpoints");
                }
                endpoints
            },
            Err(e) => {
                error!(name, "directory load failed: {e:#}");
                Vec::new()
            },
        }
    }

    async fn start_watcher(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.watcher.lock().expect("watcher lock");
        if guard.is_some() {
            info!("watcher is already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry = self.clone();
        let store = self.store.clone();

        let task = tokio::spawn(async move {
            let mut watch = match store.watch_prefix(SERVICE_PREFIX).await {
                Ok(watch) => watch,
                Err(e) => {
                    error!("failed to start directory watch: {e:#}");
                    return;
                },
            };
            info!(prefix = SERVICE_PREFIX, "directory watcher started");

            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = watch.cancel().await {
                            debug!("watch cancel: {e:#}");
                        }
                        return;
                    },
                    event = watch.next_event() => event,
                };
                match event {
                    Ok(Some(event)) => registry.handle_watch_event(event).await,
                    Ok(None) => {
                        info!("directory watch stream ended");
                        return;
                    },
                    Err(e) => {
                        error!("directory watcher error: {e:#}");
                        return;
                    },
                }
            }
        });

        *guard = Some(WatcherHandle { cancel, task });
        Ok(())
    }

    /// Stops the watcher, cancelling the subscription explicitly.
    pub async fn stop_watcher(&self) {
        let handle = self.watcher.lock().expect("watcher lock").take();
        if let Some(WatcherHandle { cancel, task }) = handle {
            cancel.cancel();
            let _ = task.await;
            info!("directory watcher stopped");
        }
    }

    async fn handle_watch_event(&self, event: WatchEvent) {
        debug!(key = %event.key, kind = ?event.kind, "directory watch event");
        match event.kind {
            WatchEventKind::Delete | WatchEventKind::Expire => {
                let Some(name) = service_name_from_key(&event.key) else {
                    return;
                };
                self.invalidate(&name).await;
            },
            // Additions refresh lazily on the next cache miss.
            WatchEventKind::Put => {},
        }
    }

    async fn invalidate(&self, name: &str) {
        let bucket = &self.buckets[bucket_index(name)];
        let mut map = bucket.map.lock().await;
        bucket.dirty.store(true, Ordering::Release);
        if map.remove(name).is_some() {
            info!(name, "evicted service from cache after watch event");
        }
    }

    /// Drops every keep-alive handle; registered keys lapse when their
    /// leases run out.
    pub fn drop_keep_alives(&self) {
        self.keep_alives.lock().expect("keep alive lock").clear();
    }
}

/// Extracts the service name from `/rocket/service/{name}/{endpoint}`.
fn service_name_from_key(key: &str) -> Option<String> {
    let rest = key.strip_prefix(SERVICE_PREFIX)?;
    let name = rest.split('/').next()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

fn bucket_index(name: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() as usize) % BUCKET_COUNT
}

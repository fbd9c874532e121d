use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use rocket_rpc::registry::{
    service_registry::{SERVICE_PREFIX, ServiceRegistry},
    store::{MemoryStore, RegistryStore},
};

/// Polls `condition` until it yields true or the deadline passes.
async fn wait_until<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn discover_hits_the_cache_until_invalidated() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registry = ServiceRegistry::new(store.clone() as Arc<dyn RegistryStore>);

    registry.register_service("Order", "127.0.0.1", 7001).await?;
    assert_eq!(
        registry.discover("Order").await,
        vec!["127.0.0.1:7001".to_string()]
    );

    // No watcher on this registry: removing the key leaves the cached copy
    // in place.
    store
        .delete(&format!("{SERVICE_PREFIX}Order/127.0.0.1:7001"))
        .await?;
    assert_eq!(
        registry.discover("Order").await,
        vec!["127.0.0.1:7001".to_string()],
        "cache must serve the stale entry without a watcher"
    );
    Ok(())
}

#[tokio::test]
async fn watcher_delete_event_forces_a_reload() -> Result<()> {
    let store = Arc::new(MemoryStore::new());

    let server_registry =
        ServiceRegistry::new(store.clone() as Arc<dyn RegistryStore>);
    server_registry
        .register_service("Order", "127.0.0.1", 7002)
        .await?;

    let client_registry =
        ServiceRegistry::init_as_client(store.clone() as Arc<dyn RegistryStore>)
            .await?;
    assert_eq!(
        client_registry.discover("Order").await,
        vec!["127.0.0.1:7002".to_string()]
    );

    server_registry
        .unregister_service("Order", "127.0.0.1:7002")
        .await;

    // The watcher marks the bucket dirty and evicts; the next discover must
    // reload from the store and come back empty.
    wait_until(
        || {
            let registry = client_registry.clone();
            async move { registry.discover("Order").await.is_empty() }
        },
        "cache eviction after delete",
    )
    .await;

    client_registry.stop_watcher().await;
    Ok(())
}

#[tokio::test]
async fn lease_expiry_event_also_invalidates() -> Result<()> {
    let store = Arc::new(MemoryStore::new());

    let server_registry =
        ServiceRegistry::new(store.clone() as Arc<dyn RegistryStore>);
    server_registry
        .register_service("Pay", "127.0.0.1", 7003)
        .await?;

    let client_registry =
        ServiceRegistry::init_as_client(store.clone() as Arc<dyn RegistryStore>)
            .await?;
    assert_eq!(
        client_registry.discover("Pay").await,
        vec!["127.0.0.1:7003".to_string()]
    );

    store.expire(&format!("{SERVICE_PREFIX}Pay/127.0.0.1:7003"));

    wait_until(
        || {
            let registry = client_registry.clone();
            async move { registry.discover("Pay").await.is_empty() }
        },
        "cache eviction after expire",
    )
    .await;

    client_registry.stop_watcher().await;
    Ok(())
}

#[tokio::test]
async fn unknown_service_resolves_to_empty_list() {
    let store = Arc::new(MemoryStore::new());
    let registry = ServiceRegistry::new(store as Arc<dyn RegistryStore>);
    assert!(registry.discover("Ghost").await.is_empty());
}

#[tokio::test]
async fn multiple_endpoints_are_all_discovered() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let registry = ServiceRegistry::new(store as Arc<dyn RegistryStore>);

    registry.register_service("Order", "127.0.0.1", 7004).await?;
    registry.register_service("Order", "127.0.0.1", 7005).await?;

    let mut endpoints = registry.discover("Order").await;
    endpoints.sort();
    assert_eq!(
        endpoints,
        vec!["127.0.0.1:7004".to_string(), "127.0.0.1:7005".to_string()]
    );
    Ok(())
}

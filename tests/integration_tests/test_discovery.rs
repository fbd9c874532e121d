use std::{sync::Arc, time::Duration};

use anyhow::Result;
use rocket_rpc::{
    cfg::config::Config,
    error::error_code,
    registry::{
        service_registry::{SERVICE_PREFIX, ServiceRegistry},
        store::{MemoryStore, RegistryStore},
    },
    rpc::{channel::RpcChannel, controller::RpcController},
};
use serial_test::serial;

use crate::integration_tests::support::{
    MakeOrderRequest, MakeOrderResponse, OrderImpl, TestServer, run_on_client_loop,
};

fn client_config_with_stub(stub_addr: &str) -> Config {
    let yaml = format!(
        r#"
log:
  level: info
stubs:
  Echo:
    addr: "{stub_addr}"
    timeout_ms: 1500
"#
    );
    serde_yaml::from_str(&yaml).expect("config yaml")
}

fn server_config_for(name: &str, addr: std::net::SocketAddr) -> Config {
    let yaml = format!(
        r#"
log:
  level: info
services:
  - name: {name}
    host: {host}
    port: {port}
"#,
        name = name,
        host = addr.ip(),
        port = addr.port(),
    );
    serde_yaml::from_str(&yaml).expect("config yaml")
}

#[test]
#[serial]
fn resolves_literal_endpoints_and_stubs_without_a_directory() -> Result<()> {
    run_on_client_loop(async move {
        let addrs =
            RpcChannel::find_addr("127.0.0.1:9099", None, None).await;
        assert_eq!(addrs, vec!["127.0.0.1:9099".parse().expect("addr")]);

        let cfg = client_config_with_stub("127.0.0.1:9100");
        let addrs = RpcChannel::find_addr("Echo", None, Some(&cfg)).await;
        assert_eq!(addrs, vec!["127.0.0.1:9100".parse().expect("addr")]);

        let addrs = RpcChannel::find_addr("Nowhere", None, Some(&cfg)).await;
        assert!(addrs.is_empty());
    })
}

#[test]
#[serial]
fn discovery_routes_calls_and_lease_expiry_empties_the_directory() -> Result<()> {
    let order = Arc::new(OrderImpl::default());
    let server = TestServer::start_order(order)?;
    let server_addr = server.addr();

    let store = Arc::new(MemoryStore::new());
    let watch_store = store.clone();

    run_on_client_loop(async move {
        // Server side: register the provided services from config under a
        // kept-alive lease.
        let cfg = server_config_for("Order", server_addr);
        let _server_registry = ServiceRegistry::init_as_server(
            &cfg,
            watch_store.clone() as Arc<dyn RegistryStore>,
        )
        .await;
        assert!(watch_store.contains(&format!(
            "{SERVICE_PREFIX}Order/{server_addr}"
        )));

        // Client side: resolve the service name through the directory and
        // call it.
        let client_registry = ServiceRegistry::init_as_client(
            watch_store.clone() as Arc<dyn RegistryStore>,
        )
        .await
        .expect("client registry");

        let addrs =
            RpcChannel::find_addr("Order", Some(&client_registry), None).await;
        assert_eq!(addrs, vec![server_addr]);

        let channel = RpcChannel::new(addrs);
        let controller = Arc::new(RpcController::new());
        controller.set_timeout(Duration::from_secs(10));
        let request = MakeOrderRequest {
            price: 100,
            goods: "apple".to_string(),
        };
        let response = channel
            .unary::<MakeOrderResponse>("Order.makeOrder", &controller, &request)
            .await
            .expect("unary call");
        assert_eq!(controller.error_code(), 0);
        assert_eq!(response.order_id, "20230514");

        // The server goes away and its lease lapses; the watcher evicts the
        // cache entry and the next resolution comes back empty.
        watch_store.expire(&format!("{SERVICE_PREFIX}Order/{server_addr}"));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if client_registry.discover("Order").await.is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "directory entry never expired"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let addrs =
            RpcChannel::find_addr("Order", Some(&client_registry), None).await;
        assert!(addrs.is_empty());

        // A call against the empty endpoint list fails fast.
        let channel = RpcChannel::new(addrs);
        let controller = Arc::new(RpcController::new());
        let request = MakeOrderRequest::default();
        let _ = channel
            .unary::<MakeOrderResponse>("Order.makeOrder", &controller, &request)
            .await
            .expect("unary call");
        assert_eq!(
            controller.error_code(),
            error_code::ERROR_RPC_PEER_ADDR
        );

        client_registry.stop_watcher().await;
    })?;

    server.shutdown();
    Ok(())
}

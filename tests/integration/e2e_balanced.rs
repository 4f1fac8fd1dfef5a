//! End-to-end balanced client: registry-driven resolution, random
//! endpoint selection, and coalesced per-address dialing under
//! concurrency.

use ferrite::{BalancedClient, ClientConfig, RegistryClient, RegistryServer, ServerConfig};
use ferrite_test_utils::{counter_service, TestServer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TICK: Duration = Duration::from_secs(1);

fn no_heartbeat() -> ServerConfig {
    ServerConfig {
        tick: 0,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn ten_concurrent_calls_spread_over_three_instances() {
    let registry = RegistryServer::start().await.expect("start registry");
    let counter = Arc::new(AtomicU64::new(0));

    let mut servers = Vec::new();
    let mut providers = Vec::new();
    for _ in 0..3 {
        let server =
            TestServer::start(no_heartbeat(), vec![counter_service(counter.clone())]).await;
        let provider =
            RegistryClient::register("Depot", server.addr(), &registry.addr(), TICK)
                .await
                .expect("register provider");
        servers.push(server);
        providers.push(provider);
    }

    let balanced = BalancedClient::connect(None, &registry.addr(), ClientConfig::default())
        .await
        .expect("balanced client");

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let balanced = balanced.clone();
        tasks.push(tokio::spawn(async move {
            balanced.call("Depot:Inc", vec![]).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("call");
    }

    assert_eq!(
        counter.load(Ordering::SeqCst),
        10,
        "every call must land exactly once"
    );
    let total_connections: usize = servers.iter().map(ferrite_test_utils::TestServer::connections).sum();
    assert!(
        total_connections <= 3,
        "at most one underlying client per address, saw {total_connections}"
    );
    for server in &servers {
        assert!(
            server.connections() <= 1,
            "per-address dials must coalesce"
        );
    }

    balanced.close().await;
    for provider in providers {
        provider.close().await;
    }
    registry.close();
}

#[tokio::test]
async fn balanced_calls_follow_membership_changes() {
    let registry = RegistryServer::start().await.expect("start registry");
    let counter = Arc::new(AtomicU64::new(0));
    let server = TestServer::start(no_heartbeat(), vec![counter_service(counter.clone())]).await;
    let provider = RegistryClient::register("Depot", server.addr(), &registry.addr(), TICK)
        .await
        .expect("register provider");

    let balanced = BalancedClient::connect(None, &registry.addr(), ClientConfig::default())
        .await
        .expect("balanced client");
    balanced.call("Depot:Inc", vec![]).await.expect("first call");
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // The only instance resigns; the push empties the cache and new calls
    // fail with the no-instance error.
    provider.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let err = balanced
        .call("Depot:Inc", vec![])
        .await
        .expect_err("no instances remain");
    assert_eq!(err, ferrite::RpcError::NoAvailableInstance);

    balanced.close().await;
    registry.close();
}

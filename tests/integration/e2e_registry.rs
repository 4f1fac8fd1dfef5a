//! End-to-end registry lifecycle: registration, heartbeat-driven
//! liveness, resign-on-close, eviction of silent services, and push
//! updates landing in subscriber caches.

use ferrite::{RegistryClient, RegistryServer};
use std::time::Duration;

const TICK: Duration = Duration::from_secs(1);

#[tokio::test]
async fn beating_services_stay_tracked_and_closed_ones_vanish() {
    let registry = RegistryServer::start().await.expect("start registry");
    let a = RegistryClient::register("Alpha", "127.0.0.1:9001", &registry.addr(), TICK)
        .await
        .expect("register Alpha");
    let b = RegistryClient::register("Beta", "127.0.0.1:9002", &registry.addr(), TICK)
        .await
        .expect("register Beta");
    let consumer = RegistryClient::register("Watcher", "", &registry.addr(), TICK)
        .await
        .expect("register consumer");

    // Subscribe to both names before anything changes.
    assert_eq!(
        consumer.get_service_addresses("Alpha").await.expect("lookup"),
        vec!["127.0.0.1:9001".to_owned()]
    );
    assert_eq!(
        consumer.get_service_addresses("Beta").await.expect("lookup"),
        vec!["127.0.0.1:9002".to_owned()]
    );

    // Both instances outlive several eviction windows on heartbeats
    // alone.
    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert_eq!(
        consumer.force_lookup("Alpha").await.expect("lookup"),
        vec!["127.0.0.1:9001".to_owned()]
    );
    assert_eq!(
        consumer.force_lookup("Beta").await.expect("lookup"),
        vec!["127.0.0.1:9002".to_owned()]
    );

    // Alpha resigns: lookups empty out, and the push clears the
    // subscriber's cached entry without any explicit refresh.
    a.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        consumer
            .get_service_addresses("Alpha")
            .await
            .expect("lookup")
            .is_empty(),
        "resigned service must disappear"
    );

    b.close().await;
    consumer.close().await;
    registry.close();
}

#[tokio::test]
async fn a_service_that_stops_beating_is_evicted() {
    let registry = RegistryServer::start().await.expect("start registry");
    let consumer = RegistryClient::register("Watcher", "", &registry.addr(), TICK)
        .await
        .expect("register consumer");

    // Register Gamma over raw HTTP so nothing beats on its behalf.
    let response = reqwest::Client::new()
        .get(format!("http://{}/register", registry.addr()))
        .header("name", "Gamma")
        .header("addr", "127.0.0.1:9003")
        .header("tick", "1")
        .send()
        .await
        .expect("raw register");
    assert!(response.status().is_success());

    assert_eq!(
        consumer.get_service_addresses("Gamma").await.expect("lookup"),
        vec!["127.0.0.1:9003".to_owned()]
    );

    // Three silent ticks later the supervisor has resigned it.
    tokio::time::sleep(Duration::from_millis(4000)).await;
    assert!(
        consumer.force_lookup("Gamma").await.expect("lookup").is_empty(),
        "silent service must be evicted"
    );

    consumer.close().await;
    registry.close();
}

#[tokio::test]
async fn pushes_update_subscriber_caches_as_membership_changes() {
    let registry = RegistryServer::start().await.expect("start registry");
    let consumer = RegistryClient::register("Watcher", "", &registry.addr(), TICK)
        .await
        .expect("register consumer");

    let first = RegistryClient::register("Delta", "127.0.0.1:9010", &registry.addr(), TICK)
        .await
        .expect("register first");
    assert_eq!(
        consumer.get_service_addresses("Delta").await.expect("lookup"),
        vec!["127.0.0.1:9010".to_owned()]
    );

    // A new instance joins: the cached read must include it, proving the
    // push (not a lookup) refreshed the cache.
    let second = RegistryClient::register("Delta", "127.0.0.1:9011", &registry.addr(), TICK)
        .await
        .expect("register second");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        consumer.get_service_addresses("Delta").await.expect("cached read"),
        vec!["127.0.0.1:9010".to_owned(), "127.0.0.1:9011".to_owned()]
    );

    first.close().await;
    second.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        consumer
            .get_service_addresses("Delta")
            .await
            .expect("after resigns")
            .is_empty(),
        "empty push must clear the entry"
    );

    consumer.close().await;
    registry.close();
}

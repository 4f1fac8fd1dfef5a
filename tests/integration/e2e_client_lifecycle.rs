//! End-to-end: dial deadlines, idempotent close, and heartbeat-driven
//! connection teardown.

use ferrite::{Client, ClientConfig, RpcError, ServerConfig};
use ferrite_test_utils::{slow_service, student_service, TestServer};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

#[tokio::test]
async fn dial_deadline_beats_a_valid_address() {
    let (service, _state) = student_service();
    let server = TestServer::start(
        ServerConfig {
            tick: 0,
            ..ServerConfig::default()
        },
        vec![service],
    )
    .await;

    let err = Client::connect_timeout(
        server.addr(),
        Duration::from_micros(1),
        ClientConfig::default(),
    )
    .await
    .expect_err("a one-microsecond deadline must win");
    assert_eq!(err, RpcError::DialTimeout);
}

#[tokio::test]
async fn dial_against_nothing_is_a_transport_error() {
    // Bind and immediately drop, so the port is very likely unbound.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr").to_string()
    };
    match Client::connect(&addr).await {
        Err(RpcError::Transport(_)) => {}
        other => panic!("expected Transport error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn close_terminates_pending_calls_and_coalesces() {
    let (service, _state) = slow_service(Duration::from_millis(400));
    let server = TestServer::start(
        ServerConfig {
            tick: 0,
            call_budget: Duration::from_secs(2),
        },
        vec![service],
    )
    .await;
    let client = Client::connect(server.addr()).await.expect("connect");
    assert!(client.is_available());

    let call = client.go("Slow:SetName", vec![json!("orphan")]).await;
    client.close().await;
    client.close().await;
    assert!(!client.is_available());

    call.wait().await;
    assert_eq!(call.error(), Some(RpcError::WaitingForReceiving));

    // Calls issued after close fail fast without touching the wire.
    let late = client.go("Slow:GetName", vec![]).await;
    assert_eq!(late.error(), Some(RpcError::Shutdown));
}

#[tokio::test]
async fn missed_heartbeats_tear_the_connection_down() {
    // The server expects a beat every second; the client deliberately
    // never sends one. A slow call is left pending so the teardown has
    // something to terminate.
    let (service, _state) = slow_service(Duration::from_millis(2800));
    let server = TestServer::start(
        ServerConfig {
            tick: 1,
            call_budget: Duration::from_secs(3),
        },
        vec![service],
    )
    .await;
    let client = Client::connect_config(
        server.addr(),
        ClientConfig {
            keep_alive: false,
            ..ClientConfig::default()
        },
    )
    .await
    .expect("connect");

    let started = Instant::now();
    let err = client
        .call("Slow:SetName", vec![json!("never delivered")])
        .await
        .expect_err("connection must die before the response");
    assert_eq!(err, RpcError::Shutdown);
    let elapsed = started.elapsed();
    assert!(
        elapsed > Duration::from_millis(1500) && elapsed < Duration::from_millis(4000),
        "teardown expected around twice the tick, took {elapsed:?}"
    );
    assert!(!client.is_available());
}

#[tokio::test]
async fn heartbeats_keep_an_idle_connection_alive() {
    let (service, _state) = student_service();
    let server = TestServer::start(
        ServerConfig {
            tick: 1,
            ..ServerConfig::default()
        },
        vec![service],
    )
    .await;
    let client = Client::connect(server.addr()).await.expect("connect");

    // Idle well past the two-tick window; the keep-alive sender must hold
    // the connection open.
    tokio::time::sleep(Duration::from_millis(3200)).await;
    let reply = client
        .call("Student:GetName", vec![])
        .await
        .expect("connection must still be alive");
    assert_eq!(reply, Some(json!("")));

    client.close().await;
}

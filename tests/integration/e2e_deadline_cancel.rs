//! End-to-end: server-side dispatch budgets and client-side local
//! cancellation. In both cases the invocation itself runs to completion
//! and its side effect remains observable; only the response path is cut.

use ferrite::{Client, RpcError, ServerConfig, SERVICE_TIMEOUT};
use ferrite_test_utils::{slow_service, TestServer};
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test]
async fn dispatch_over_budget_returns_service_timeout() {
    // SetName sleeps past the 700 ms default budget.
    let (service, _state) = slow_service(Duration::from_secs(1));
    let server = TestServer::start(
        ServerConfig {
            tick: 0,
            ..ServerConfig::default()
        },
        vec![service],
    )
    .await;
    let client = Client::connect(server.addr()).await.expect("connect");

    let err = client
        .call("Slow:SetName", vec![json!("late")])
        .await
        .expect_err("budget must win");
    assert_eq!(err, RpcError::Remote(SERVICE_TIMEOUT.to_owned()));

    // The abandoned invocation still completed server-side.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let reply = client
        .call("Slow:GetName", vec![])
        .await
        .expect("follow-up read");
    assert_eq!(reply, Some(json!("late")));

    client.close().await;
}

#[tokio::test]
async fn local_cancellation_abandons_but_does_not_cancel_the_work() {
    // SetName sleeps 400 ms, comfortably within the 2 s budget; the
    // caller gives up after 200 ms.
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

    let started = Instant::now();
    let err = client
        .call_until(
            Duration::from_millis(200),
            "Slow:SetName",
            vec![json!("feifei")],
        )
        .await
        .expect_err("must cancel locally");
    assert_eq!(err, RpcError::WaitingForReceiving);
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "cancellation took {:?}",
        started.elapsed()
    );

    // The server finished the write; the late response for the cancelled
    // sequence was discarded without disturbing this call.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let reply = client
        .call("Slow:GetName", vec![])
        .await
        .expect("follow-up read");
    assert_eq!(reply, Some(json!("feifei")));

    client.close().await;
}

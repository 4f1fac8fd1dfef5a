//! End-to-end: dial, negotiate, and exchange calls against a live server.
//!
//! Covers both codecs, no-output methods, struct payloads, and the
//! invocation-error path (the connection survives an unknown target).

use ferrite::protocol::{CodecKind, ConnectOption};
use ferrite::{Client, ClientConfig, RpcError, ServerConfig, SERVICE_NOT_FOUND};
use ferrite_test_utils::{student_service, TestServer};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn no_heartbeat() -> ServerConfig {
    ServerConfig {
        tick: 0,
        ..ServerConfig::default()
    }
}

async fn connect_with_codec(addr: &str, codec_type: CodecKind) -> Client {
    let config = ClientConfig {
        option: ConnectOption {
            codec_type,
            ..ConnectOption::default()
        },
        ..ClientConfig::default()
    };
    Client::connect_config(addr, config).await.expect("connect")
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let (service, _state) = student_service();
    let server = TestServer::start(no_heartbeat(), vec![service]).await;
    let client = Client::connect(server.addr()).await.expect("connect");

    let reply = client
        .call("Student:SetName", vec![json!("weiwei")])
        .await
        .expect("SetName");
    assert_eq!(reply, None);

    let call = client.go("Student:GetName", vec![]).await;
    call.wait().await;
    assert_eq!(call.error(), None);
    assert_eq!(
        call.reply_as::<String>().expect("decode"),
        Some("weiwei".to_owned())
    );

    // Determinism: the same read twice yields the same value.
    let first = client.call("Student:GetName", vec![]).await.expect("read");
    let second = client.call("Student:GetName", vec![]).await.expect("read");
    assert_eq!(first, second);

    client.close().await;
}

#[tokio::test]
async fn unknown_target_fails_the_call_but_not_the_connection() {
    let (service, _state) = student_service();
    let server = TestServer::start(no_heartbeat(), vec![service]).await;
    let client = Client::connect(server.addr()).await.expect("connect");

    let err = client
        .call("NoSuch:Method", vec![json!("xiaobai")])
        .await
        .expect_err("unregistered service must fail");
    assert_eq!(err, RpcError::Remote(SERVICE_NOT_FOUND.to_owned()));

    client
        .call("Student:SetName", vec![json!("still works")])
        .await
        .expect("connection must survive the invocation error");
    client.close().await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Parents {
    mother: String,
    father: String,
}

#[tokio::test]
async fn struct_payloads_survive_both_codecs() {
    for codec_type in [CodecKind::Binary, CodecKind::Json] {
        let stored: Arc<Mutex<Option<Parents>>> = Arc::new(Mutex::new(None));
        let set_state = stored.clone();
        let get_state = stored.clone();
        let service = ferrite::ServiceBuilder::new("Student")
            .expect("exported name")
            .method1("SetParents", move |parents: Parents| {
                *set_state.lock().expect("state lock") = Some(parents);
            })
            .method0("GetParents", move || {
                get_state.lock().expect("state lock").clone()
            })
            .build();
        let server = TestServer::start(no_heartbeat(), vec![service]).await;
        let client = connect_with_codec(server.addr(), codec_type).await;

        let parents = Parents {
            mother: "a".to_owned(),
            father: "b".to_owned(),
        };
        client
            .call(
                "Student:SetParents",
                vec![serde_json::to_value(&parents).expect("encode")],
            )
            .await
            .expect("SetParents");
        let call = client.go("Student:GetParents", vec![]).await;
        call.wait().await;
        assert_eq!(
            call.reply_as::<Parents>().expect("decode"),
            Some(parents),
            "codec {codec_type:?}"
        );

        // Repeated struct payloads exercise the announce-once type path
        // on the binary codec.
        client
            .call(
                "Student:SetParents",
                vec![json!({"mother": "c", "father": "d"})],
            )
            .await
            .expect("second SetParents");

        client.close().await;
    }
}

#[tokio::test]
async fn concurrent_calls_complete_independently() {
    let (service, _state) = student_service();
    let server = TestServer::start(no_heartbeat(), vec![service]).await;
    let client = Client::connect(server.addr()).await.expect("connect");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .call("Student:SetName", vec![json!(format!("name-{i}"))])
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("call");
    }

    let name: Option<String> = {
        let call = client.go("Student:GetName", vec![]).await;
        tokio::time::timeout(Duration::from_secs(2), call.wait())
            .await
            .expect("completion");
        call.reply_as().expect("decode")
    };
    let name = name.expect("some name won");
    assert!(name.starts_with("name-"), "unexpected terminal name {name}");

    client.close().await;
}

//! HTTP surface tests.
//!
//! Each test starts the real router on 127.0.0.1 with an ephemeral port
//! and talks to it with reqwest.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use centi_relay::backend::StreamTransport;
use centi_relay::{Dispatcher, Relay};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct TestServer {
    base_url: String,
    relay: Arc<Relay>,
    transport: Arc<StreamTransport>,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let transport = Arc::new(StreamTransport::new("127.0.0.1", 0));
        let relay = Arc::new(Relay::new(transport.clone()));
        let dispatcher = Dispatcher::new(relay.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(centi_api::serve(listener, dispatcher, async move {
            let _ = stopped.await;
        }));

        Self {
            base_url: format!("http://{addr}"),
            relay,
            transport,
            stop: Some(stop),
            handle,
        }
    }

    async fn command(&self, message_type: &str, args: Value) -> Value {
        let body = json!({"message_type": message_type, "args": args});
        let resp = reqwest::Client::new()
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio_test::assert_ok!(self.handle.await.unwrap());
        self.relay.shutdown().await;
    }
}

#[tokio::test]
async fn test_post_on_any_path_dispatches() {
    let server = TestServer::start().await;

    let resp = reqwest::Client::new()
        .post(format!("{}/some/other/path", server.base_url))
        .body(r#"{"message_type": "message_from_bytes", "args": {}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message_type"], "message_from_bytes");
    assert_eq!(body["status"], "success");
    assert_eq!(body["args"]["test_argument"], "test_value");

    server.stop().await;
}

#[tokio::test]
async fn test_get_is_forbidden_with_empty_body() {
    let server = TestServer::start().await;

    let resp = reqwest::get(&server.base_url).await.unwrap();
    assert_eq!(resp.status(), 403);
    assert!(resp.text().await.unwrap().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_body_gets_empty_success() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    for body in ["not json", r#"{"args": {}}"#, ""] {
        let resp = client
            .post(&server.base_url)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "body: {body:?}");
        assert!(resp.text().await.unwrap().is_empty(), "body: {body:?}");
    }

    // The service keeps answering afterwards.
    let health = server.command("health", json!({})).await;
    assert_eq!(health["status"], "success");

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_and_invalid_commands_fail() {
    let server = TestServer::start().await;

    let resp = server.command("frobnicate", json!({})).await;
    assert_eq!(resp["message_type"], "frobnicate");
    assert_eq!(resp["status"], "failure");
    assert!(resp["args"]["error"]
        .as_str()
        .unwrap()
        .contains("frobnicate"));

    let resp = server.command("init_channels", json!({})).await;
    assert_eq!(resp["status"], "failure");

    let resp = server
        .command("send", json!({"message": {"data": "%%%not-base64%%%"}}))
        .await;
    assert_eq!(resp["status"], "failure");

    server.stop().await;
}

#[tokio::test]
async fn test_two_services_exchange_messages_over_http() {
    let server = TestServer::start().await;
    let client = TestServer::start().await;

    server
        .command("init_microservice", json!({"run_as_server": true}))
        .await;
    let link_addr = server.transport.local_addr().unwrap().to_string();

    for (node, key) in [(&server, "server-key"), (&client, "client-key")] {
        let resp = node
            .command(
                "distribute_pk",
                json!({"distribution_parameters": {}, "public_key": STANDARD.encode(key)}),
            )
            .await;
        assert_eq!(resp["status"], "success");
    }

    let resp = client
        .command("init_channels", json!({"channels": [["server", link_addr]]}))
        .await;
    assert_eq!(resp["status"], "success");

    let payload = vec![7u8; 3000];
    client
        .command(
            "send",
            json!({"message": {"data": STANDARD.encode(&payload)}}),
        )
        .await;

    let mut messages = Vec::new();
    for _ in 0..400 {
        let resp = server.command("recv_messages", json!({})).await;
        messages.extend(resp["args"]["messages"].as_array().unwrap().clone());
        if !messages.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["platform"], "bluetooth");
    assert_eq!(
        STANDARD.decode(messages[0]["data"].as_str().unwrap()).unwrap(),
        payload
    );

    let keys = server.command("collect_pks", json!({})).await;
    assert_eq!(
        keys["args"]["public_keys"][0]["content"],
        STANDARD.encode("client-key")
    );

    client.stop().await;
    server.stop().await;
}

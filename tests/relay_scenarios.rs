//! End-to-end relay scenarios, driven over real loopback sockets against a
//! server bound to `127.0.0.1:0` (spec.md §8 "end-to-end scenarios").
//!
//! Grounded on `tests/mock_chrome.rs` in the base crate: bind port 0, read
//! back the OS-assigned port with `local_addr()`, spawn the accept loop, and
//! drive a `tokio-tungstenite` client against it.

use std::sync::Arc;
use std::time::Duration;

use cdp_relay_core::config::Config;
use cdp_relay_core::relay::Relay;
use cdp_relay_core::server;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_relay(config: Config) -> (String, Arc<Relay>) {
    let listener = TcpListener::bind(format!("{}:0", config.host)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Relay::new(config);
    let spawned = relay.clone();
    tokio::spawn(async move {
        let _ = server::serve_listener(listener, spawned).await;
    });
    (format!("ws://{addr}"), relay)
}

async fn connect_with_origin(url: &str, origin: Option<&str>) -> WsStream {
    let mut request = url.into_client_request().unwrap();
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("Origin", origin.parse().unwrap());
    }
    let (stream, _response) = connect_async(request).await.unwrap();
    stream
}

/// A stand-in extension on the other end of `/extension`: auto-responds to
/// every request frame with `{}` unless `silent` is set (scenario 6), and
/// records every frame the Core sends it so a test can assert on commands
/// like `Runtime.runIfWaitingForDebugger`.
struct ExtensionMock {
    sink_tx: tokio::sync::mpsc::UnboundedSender<Message>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl ExtensionMock {
    async fn connect(base: &str, query: &str, origin: &str, tag: &str, silent: bool) -> Self {
        let ws = connect_with_origin(&format!("{base}/extension?{query}"), Some(origin)).await;
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let tag = tag.to_string();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let tx_clone = tx.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        received_clone.lock().await.push(value.clone());
                        if let Some(id) = value.get("id").and_then(Value::as_u64) {
                            let reply = json!({"id": id, "result": {"echo": tag}});
                            if !silent {
                                let _ = tx_clone.send(Message::Text(reply.to_string()));
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let _ = tx_clone.send(Message::Close(frame));
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        Self {
            sink_tx: tx,
            received,
        }
    }

    fn send_event(&self, method: &str, outer_session: Option<&str>, params: Value) {
        let wrapped = json!({
            "method": "forwardCDPEvent",
            "params": {
                "method": method,
                "sessionId": outer_session,
                "params": params,
            },
        });
        let _ = self.sink_tx.send(Message::Text(wrapped.to_string()));
    }

    async fn saw_method(&self, method: &str) -> bool {
        self.received
            .lock()
            .await
            .iter()
            .any(|frame| frame.get("method").and_then(Value::as_str) == Some(method))
    }
}

struct DriverMock {
    ws: WsStream,
}

impl DriverMock {
    async fn connect(base: &str, client_id: &str, extension_id: Option<&str>) -> Self {
        let mut url = format!("{base}/cdp/{client_id}");
        if let Some(id) = extension_id {
            url.push_str(&format!("?extensionId={id}"));
        }
        Self {
            ws: connect_with_origin(&url, None).await,
        }
    }

    async fn send_command(&mut self, id: u64, method: &str, params: Value) {
        let frame = json!({"id": id, "method": method, "params": params});
        self.ws.send(Message::Text(frame.to_string())).await.unwrap();
    }

    async fn next_frame(&mut self, timeout: Duration) -> Option<Value> {
        match tokio::time::timeout(timeout, self.ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).ok(),
            Ok(Some(Ok(Message::Close(frame)))) => {
                Some(json!({"__close": true, "code": frame.map(|f| u16::from(f.code))}))
            }
            _ => None,
        }
    }

    async fn expect_no_frame(&mut self, timeout: Duration) -> bool {
        self.next_frame(timeout).await.is_none()
    }
}

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        extension_origin_allowlist: vec!["test-ext".to_string(), "p1-ext".to_string()],
        ping_interval_ms: 60_000,
        ..Config::default()
    }
}

#[tokio::test]
async fn scenario_1_basic_attach_and_fan_in() {
    let (base, _relay) = spawn_relay(test_config()).await;
    let _ext = ExtensionMock::connect(&base, "id=e1", "chrome-extension://test-ext", "e1", false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut driver = DriverMock::connect(&base, "a", None).await;
    driver
        .send_command(1, "Target.setAutoAttach", json!({"autoAttach": true, "waitForDebuggerOnStart": false}))
        .await;

    let response = driver.next_frame(Duration::from_secs(2)).await.unwrap();
    assert_eq!(response["id"], 1);
    assert!(response.get("error").is_none());

    assert!(driver.expect_no_frame(Duration::from_millis(150)).await);

    _ext.send_event(
        "Target.attachedToTarget",
        None,
        json!({
            "sessionId": "pw-tab-1",
            "targetInfo": {"targetId": "T1", "type": "page", "url": "https://a", "attached": true},
            "waitingForDebugger": false,
        }),
    );

    let event = driver.next_frame(Duration::from_secs(2)).await.unwrap();
    assert_eq!(event["method"], "Target.attachedToTarget");
    assert_eq!(event["sessionId"], "pw-tab-1");
    assert_eq!(event["params"]["targetInfo"]["attached"], true);
}

#[tokio::test]
async fn scenario_2_iframe_reparenting() {
    let (base, _relay) = spawn_relay(test_config()).await;
    let ext = ExtensionMock::connect(&base, "id=e2", "chrome-extension://test-ext", "e2", false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut driver = DriverMock::connect(&base, "a", None).await;

    ext.send_event(
        "Target.attachedToTarget",
        None,
        json!({
            "sessionId": "pw-tab-1",
            "targetInfo": {"targetId": "T1", "type": "page", "url": "https://a"},
            "waitingForDebugger": false,
        }),
    );
    let first = driver.next_frame(Duration::from_secs(2)).await.unwrap();
    assert_eq!(first["sessionId"], "pw-tab-1");

    ext.send_event(
        "Page.frameAttached",
        Some("pw-tab-1"),
        json!({"frameId": "F1", "parentFrameId": "F0"}),
    );
    ext.send_event("Page.frameNavigated", Some("pw-tab-1"), json!({"frame": {"id": "F1"}}));

    // Both are forwarded verbatim; drain them before the interesting event.
    let _ = driver.next_frame(Duration::from_secs(2)).await;
    let _ = driver.next_frame(Duration::from_secs(2)).await;

    ext.send_event(
        "Target.attachedToTarget",
        None,
        json!({
            "sessionId": "pw-tab-2",
            "targetInfo": {"targetId": "T2", "type": "iframe", "url": "https://b", "parentFrameId": "F1"},
            "waitingForDebugger": false,
        }),
    );

    let reparented = driver.next_frame(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reparented["method"], "Target.attachedToTarget");
    assert_eq!(reparented["sessionId"], "pw-tab-1");
    assert_eq!(reparented["params"]["sessionId"], "pw-tab-2");
}

#[tokio::test]
async fn scenario_3_restricted_target_suppressed() {
    let (base, _relay) = spawn_relay(test_config()).await;
    let ext = ExtensionMock::connect(&base, "id=e3", "chrome-extension://test-ext", "e3", false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut driver = DriverMock::connect(&base, "a", None).await;

    ext.send_event(
        "Target.attachedToTarget",
        None,
        json!({
            "sessionId": "X",
            "targetInfo": {"targetId": "TX", "type": "page", "url": "chrome://newtab/"},
            "waitingForDebugger": true,
        }),
    );

    assert!(driver.expect_no_frame(Duration::from_millis(300)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ext.saw_method("forwardCDPCommand").await);
}

#[tokio::test]
async fn scenario_4_reconnect_rebinds_atomically() {
    let (base, relay) = spawn_relay(test_config()).await;
    let e1 = ExtensionMock::connect(&base, "id=p1", "chrome-extension://test-ext", "E1", false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut driver = DriverMock::connect(&base, "a", None).await;

    let e2 = ExtensionMock::connect(&base, "id=p1", "chrome-extension://test-ext", "E2", false).await;
    let _ = &e1;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let bound_to = relay
        .store
        .get_state()
        .playwright_clients
        .get("a")
        .and_then(|c| c.extension_id.clone());
    assert!(bound_to.is_some());

    driver.send_command(1, "Page.bringToFront", json!({})).await;
    let response = driver.next_frame(Duration::from_secs(2)).await.unwrap();
    assert_eq!(response["id"], 1);
    assert!(response.get("error").is_none());
    // The replaced extension (E1) must never be the one that answers: the
    // rebind in `teardown` is atomic, so every post-replacement command
    // resolves against the survivor (E2).
    assert_eq!(response["result"]["echo"], "E2");

    let _ = e2;
}

#[tokio::test]
async fn scenario_5_duplicate_client_id_rejected() {
    let (base, _relay) = spawn_relay(test_config()).await;
    let mut first = DriverMock::connect(&base, "dup", None).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = DriverMock::connect(&base, "dup", None).await;
    let closed = second.next_frame(Duration::from_secs(2)).await.unwrap();
    assert_eq!(closed["__close"], true);
    assert_eq!(closed["code"], 4004);

    assert!(first.expect_no_frame(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn scenario_6_extension_timeout_clears_pending() {
    let mut config = test_config();
    config.request_timeout_ms = 150;
    let (base, relay) = spawn_relay(config).await;
    let ext = ExtensionMock::connect(&base, "id=e6", "chrome-extension://test-ext", "e6", true).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = &ext;

    let mut driver = DriverMock::connect(&base, "a", None).await;
    driver.send_command(1, "Page.navigate", json!({"url": "https://a"})).await;

    let response = driver.next_frame(Duration::from_secs(2)).await.unwrap();
    assert_eq!(response["id"], 1);
    let message = response["error"]["message"].as_str().unwrap_or_default();
    assert!(message.to_lowercase().contains("timeout"));

    let state = relay.store.get_state();
    let extension_id = state.extensions.values().next().unwrap().id.clone();
    assert!(state.extensions[&extension_id].pending_requests.is_empty());
}


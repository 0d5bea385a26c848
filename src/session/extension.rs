//! Per-extension WebSocket I/O (spec §4.C).
//!
//! Grounded on the base crate's `cdp::connection` (a CDP client connection:
//! split sink/stream, a writer task draining an mpsc channel, pending
//! requests resolved by id via oneshot channels, a keep-alive timer). This
//! module is the same shape turned the other way around: the Core is the
//! one dialing commands *out* to a long-lived peer instead of *into* a
//! freshly spawned browser.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::cdp::translator;
use crate::cdp::wire::{ExtensionInbound, ExtensionRequest, ForwardCdpCommandParams};
use crate::error::{Error, Result};
use crate::relay::Relay;
use crate::state::{lookup, ExtensionId, ExtensionInfo, MessageId};

type PendingResolver = oneshot::Sender<Result<Value>>;

/// The per-extension I/O side table (spec §3's `ws`/`pendingRequests`
/// resolve-reject pairs/`pingInterval`, kept out of the pure state atom).
struct ExtensionIoHandle {
    outbound: tokio::sync::mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<MessageId, PendingResolver>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// Live extension connections, keyed by extension id.
#[derive(Clone, Default)]
pub struct ExtensionIoTable(Arc<RwLock<HashMap<ExtensionId, Arc<ExtensionIoHandle>>>>);

impl ExtensionIoTable {
    async fn insert(&self, id: ExtensionId, handle: Arc<ExtensionIoHandle>) {
        self.0.write().await.insert(id, handle);
    }

    async fn get(&self, id: &str) -> Option<Arc<ExtensionIoHandle>> {
        self.0.read().await.get(id).cloned()
    }

    async fn remove(&self, id: &str) -> Option<Arc<ExtensionIoHandle>> {
        self.0.write().await.remove(id)
    }
}

/// Outbound pipeline `sendToExtension` (spec §4.C). Fire-and-forget variant:
/// registers the pending request in both the I/O side table and the state
/// atom, but the translator's `Runtime.runIfWaitingForDebugger` nudge uses
/// this same path and simply discards the eventual result.
pub async fn send_to_extension(
    relay: &Relay,
    extension_id: &str,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value> {
    let handle = relay
        .extension_io
        .get(extension_id)
        .await
        .ok_or(Error::NoExtension)?;

    let mut allocated = None;
    relay.store.set_state(|s| {
        let (next, id) = s.increment_extension_message_id(extension_id);
        allocated = id;
        next
    });
    let message_id = allocated.ok_or(Error::NoExtension)?;

    let (tx, rx) = oneshot::channel();
    handle.pending.lock().await.insert(message_id, tx);
    relay
        .store
        .set_state(|s| s.add_extension_pending_request(extension_id, message_id));

    let frame = ExtensionRequest {
        id: message_id,
        method: method.to_string(),
        params: Some(params),
    };
    let text = serde_json::to_string(&frame)?;

    if handle.outbound.send(Message::Text(text)).is_err() {
        handle.pending.lock().await.remove(&message_id);
        relay
            .store
            .set_state(|s| s.remove_extension_pending_request(extension_id, message_id));
        return Err(Error::websocket("extension send failed"));
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(Error::ExtensionClosed),
        Err(_) => {
            handle.pending.lock().await.remove(&message_id);
            relay
                .store
                .set_state(|s| s.remove_extension_pending_request(extension_id, message_id));
            Err(Error::timeout(timeout.as_millis() as u64, method.to_string()))
        }
    }
}

/// Convenience wrapper around `send_to_extension` for the common
/// `forwardCDPCommand` shape used by the emulator for verbatim forwards.
pub async fn forward_cdp_command(
    relay: &Relay,
    extension_id: &str,
    session_id: Option<String>,
    method: &str,
    params: Value,
    source: Option<String>,
) -> Result<Value> {
    let wrapped = ForwardCdpCommandParams {
        session_id,
        method: method.to_string(),
        params,
        source,
    };
    let value = serde_json::to_value(wrapped)?;
    send_to_extension(
        relay,
        extension_id,
        "forwardCDPCommand",
        value,
        Duration::from_millis(relay.config.request_timeout_ms),
    )
    .await
}

/// Fire a command and ignore both its result and any error, logging at
/// debug. Used for the `Runtime.runIfWaitingForDebugger` nudge, which has
/// no meaningful return value Core cares about.
pub fn notify_extension(relay: Arc<Relay>, extension_id: String, session_id: String, method: &'static str) {
    tokio::spawn(async move {
        let result = forward_cdp_command(
            &relay,
            &extension_id,
            Some(session_id),
            method,
            Value::Object(Default::default()),
            None,
        )
        .await;
        if let Err(err) = result {
            debug!(%extension_id, %method, %err, "fire-and-forget extension command failed");
        }
    });
}

/// Drive one extension's WebSocket from accept to close (spec §4.C, §5).
pub async fn run_extension_session<S>(
    ws: WebSocketStream<S>,
    id: ExtensionId,
    info: ExtensionInfo,
    relay: Arc<Relay>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!(extension_id = %id, "extension connected");

    relay.store.set_state(|s| s.add_extension(id.clone(), info.clone()));

    // Replacement semantics (spec §5): close any other live entry sharing
    // this stableKey with code 4001 before this connection starts serving.
    let stable_key = info.stable_key(&id);
    {
        let state = relay.store.get_state();
        let predecessors: Vec<ExtensionId> = state
            .extensions
            .values()
            .filter(|e| e.stable_key == stable_key && e.id != id && e.io_live)
            .map(|e| e.id.clone())
            .collect();
        for predecessor in predecessors {
            if let Some(handle) = relay.extension_io.get(&predecessor).await {
                let _ = handle.outbound.send(Message::Close(Some(
                    tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(4001),
                        reason: "Extension Replaced".into(),
                    },
                )));
            }
        }
    }

    let (sink, mut stream) = ws.split();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let writer = spawn_writer(sink, rx);

    let handle = Arc::new(ExtensionIoHandle {
        outbound: tx.clone(),
        pending: Mutex::new(HashMap::new()),
        keepalive: Mutex::new(None),
    });
    relay.extension_io.insert(id.clone(), handle.clone()).await;

    let keepalive = spawn_keepalive(tx.clone(), Duration::from_millis(relay.config.ping_interval_ms));
    *handle.keepalive.lock().await = Some(keepalive);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(err) = dispatch_inbound(&relay, &id, &handle, &text).await {
                    warn!(extension_id = %id, %err, "closing extension socket: invalid frame");
                    let _ = tx.send(Message::Close(Some(
                        tokio_tungstenite::tungstenite::protocol::CloseFrame {
                            code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(1000),
                            reason: "Invalid JSON".into(),
                        },
                    )));
                    break;
                }
            }
            Ok(Message::Binary(_buf)) => {
                debug!(extension_id = %id, "binary frame handed to recording collaborator");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Err(err) => {
                warn!(extension_id = %id, %err, "extension socket error");
                break;
            }
        }
    }

    teardown(&relay, &id, &handle).await;
    writer.abort();
}

fn spawn_writer<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_keepalive(tx: tokio::sync::mpsc::UnboundedSender<Message>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ping = serde_json::json!({"method": "ping"}).to_string();
            if tx.send(Message::Text(ping)).is_err() {
                break;
            }
        }
    })
}

async fn dispatch_inbound(
    relay: &Arc<Relay>,
    extension_id: &str,
    handle: &ExtensionIoHandle,
    text: &str,
) -> Result<()> {
    let frame = ExtensionInbound::parse(text)?;
    match frame {
        ExtensionInbound::Response { id, result, error } => {
            let resolver = handle.pending.lock().await.remove(&id);
            relay
                .store
                .set_state(|s| s.remove_extension_pending_request(extension_id, id));
            match resolver {
                Some(resolver) => {
                    let outcome = match error {
                        Some(message) => Err(Error::cdp(message)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = resolver.send(outcome);
                }
                None => warn!(extension_id, id, "response for unknown pending request id"),
            }
        }
        ExtensionInbound::Pong => {}
        ExtensionInbound::Log { level, args } => {
            let joined = args.join(" ");
            match level.as_str() {
                "error" => tracing::error!(extension_id, "{joined}"),
                "warn" => warn!(extension_id, "{joined}"),
                "debug" => debug!(extension_id, "{joined}"),
                _ => info!(extension_id, "{joined}"),
            }
        }
        ExtensionInbound::RecordingData(_) | ExtensionInbound::RecordingCancelled(_) => {
            debug!(extension_id, "recording payload handed off (out of scope)");
        }
        ExtensionInbound::ForwardCdpEvent {
            method,
            session_id,
            params,
        } => {
            translator::handle_forwarded_event(relay.clone(), extension_id.to_string(), method, session_id, params)
                .await;
        }
        ExtensionInbound::UnknownMethod(method) => {
            debug!(extension_id, method, "unrecognized extension method ignored");
        }
    }
    Ok(())
}

/// Socket close teardown (spec §5, five steps; step 1 "cancel recording
/// relay" is the out-of-scope collaborator's responsibility, not ours).
async fn teardown(relay: &Relay, extension_id: &str, handle: &ExtensionIoHandle) {
    if let Some(keepalive) = handle.keepalive.lock().await.take() {
        keepalive.abort();
    }

    let pending: Vec<PendingResolver> = handle.pending.lock().await.drain().map(|(_, v)| v).collect();
    for resolver in pending {
        let _ = resolver.send(Err(Error::ExtensionClosed));
    }
    relay.store.set_state(|s| {
        let (next, _cleared) = s.clear_extension_pending_requests(extension_id);
        next
    });

    relay
        .store
        .set_state(|s| s.update_extension_io(extension_id, false));

    let state = relay.store.get_state();
    let stable_key = state
        .extensions
        .get(extension_id)
        .map(|e| e.stable_key.clone())
        .unwrap_or_default();
    let successor = lookup::find_extension_by_stable_key(&state, &stable_key).map(|e| e.id.clone());

    match successor {
        Some(successor_id) => {
            relay
                .store
                .set_state(|s| s.rebind_clients_to_extension(extension_id, &successor_id));
        }
        None => {
            let mut removed_ids = Vec::new();
            relay.store.set_state(|s| {
                let (next, removed) = s.remove_clients_for_extension(extension_id);
                removed_ids = removed;
                next
            });
            for client_id in removed_ids {
                relay.drivers.close(&client_id, 1000, "extension disconnected").await;
            }
        }
    }

    relay.store.set_state(|s| s.remove_extension(extension_id));
    relay.extension_io.remove(extension_id).await;
    info!(extension_id, "extension disconnected, teardown complete");
}

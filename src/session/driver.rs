//! Per-driver WebSocket I/O (spec §4.D).
//!
//! Grounded on the base crate's `session::manager` for the "one entry per
//! connection, looked up by id" registry shape, and on `cdp::connection`'s
//! split-sink writer task for the outbound half.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::cdp::emulator;
use crate::cdp::wire::{DriverCommand, DriverEvent, DriverResponse};
use crate::events::RelayEvent;
use crate::relay::Relay;
use crate::state::lookup::{get_extension_connection, LookupOptions};
use crate::state::ClientId;

struct DriverHandle {
    outbound: tokio::sync::mpsc::UnboundedSender<Message>,
}

/// Live driver connections, keyed by client id.
#[derive(Clone, Default)]
pub struct DriverRegistry(Arc<RwLock<HashMap<ClientId, Arc<DriverHandle>>>>);

impl DriverRegistry {
    pub async fn contains(&self, id: &str) -> bool {
        self.0.read().await.contains_key(id)
    }

    async fn register(&self, id: ClientId, handle: Arc<DriverHandle>) {
        self.0.write().await.insert(id, handle);
    }

    async fn remove(&self, id: &str) {
        self.0.write().await.remove(id);
    }

    /// Send an event to a single bound driver. Used both for server-wide
    /// fan-out (translator) and single-driver replay (emulator).
    pub async fn send_event(&self, client_id: &str, event: DriverEvent) {
        if let Some(handle) = self.0.read().await.get(client_id).cloned() {
            if let Ok(text) = serde_json::to_string(&event) {
                let _ = handle.outbound.send(Message::Text(text));
            }
        }
    }

    async fn send_response(&self, client_id: &str, response: DriverResponse) {
        if let Some(handle) = self.0.read().await.get(client_id).cloned() {
            if let Ok(text) = serde_json::to_string(&response) {
                // Spec §4.D: "send after close" is expected, log and swallow.
                if handle.outbound.send(Message::Text(text)).is_err() {
                    debug!(client_id, "driver send after close, swallowed");
                }
            }
        }
    }

    /// Close a driver's socket with a given WebSocket close code.
    pub async fn close(&self, client_id: &str, code: u16, reason: &str) {
        if let Some(handle) = self.0.read().await.get(client_id).cloned() {
            let _ = handle.outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })));
        }
    }
}

/// Drive one driver's WebSocket from accept to close (spec §4.D).
///
/// `requested_extension_id` is the `extensionId=` query parameter, if any;
/// acceptance gates 1 and 2 (origin, token) are enforced by the HTTP layer
/// before upgrade. Gates 3 (extension resolution) and 4 (duplicate client
/// id) are enforced here because their failure is communicated via a
/// WebSocket close code rather than an HTTP status.
pub async fn run_driver_session<S>(
    ws: WebSocketStream<S>,
    client_id: ClientId,
    requested_extension_id: Option<String>,
    relay: Arc<Relay>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    if relay.drivers.contains(&client_id).await {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(4004),
                reason: "Duplicate client id".into(),
            })))
            .await;
        return;
    }

    let bound_extension_id = {
        let state = relay.store.get_state();
        get_extension_connection(
            &state,
            requested_extension_id.as_deref(),
            LookupOptions { allow_fallback: true },
        )
        .map(|entry| entry.id.clone())
    };

    let Some(bound_extension_id) = bound_extension_id else {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(4003),
                reason: "No extension available".into(),
            })))
            .await;
        return;
    };

    info!(client_id = %client_id, extension_id = %bound_extension_id, "driver connected");
    relay
        .store
        .set_state(|s| s.add_playwright_client(client_id.clone(), Some(bound_extension_id.clone())));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });
    relay
        .drivers
        .register(client_id.clone(), Arc::new(DriverHandle { outbound: tx.clone() }))
        .await;

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(client_id = %client_id, %err, "driver socket error");
                break;
            }
        };

        let cmd: DriverCommand = match serde_json::from_str(&text) {
            Ok(cmd) => cmd,
            Err(_) => continue, // malformed JSON is silently dropped
        };

        relay.events.publish(RelayEvent::CdpCommand {
            client_id: client_id.clone(),
            id: cmd.id,
            session_id: cmd.session_id.clone(),
            method: cmd.method.clone(),
        });

        let current_extension_id = relay
            .store
            .get_state()
            .playwright_clients
            .get(&client_id)
            .and_then(|c| c.extension_id.clone());

        let response = match current_extension_id {
            None => DriverResponse::error(cmd.id, cmd.session_id.clone(), "Extension not connected"),
            Some(extension_id) => match emulator::handle_command(&relay, &extension_id, &client_id, &cmd).await {
                Ok(result) => DriverResponse::ok(cmd.id, cmd.session_id.clone(), result),
                Err(err) => DriverResponse::error(cmd.id, cmd.session_id.clone(), err.to_string()),
            },
        };

        relay.events.publish(RelayEvent::CdpResponse {
            client_id: client_id.clone(),
            id: cmd.id,
            ok: response.error.is_none(),
        });
        relay.drivers.send_response(&client_id, response).await;
    }

    relay.store.set_state(|s| s.remove_playwright_client(&client_id));
    relay.drivers.remove(&client_id).await;
    writer.abort();
    info!(client_id = %client_id, "driver disconnected");
}

//! Discovery & HTTP surface (spec §4.G).

use hyper::{Response, StatusCode};
use serde_json::json;

use crate::cdp::is_restricted;
use crate::cdp::wire::TargetInfoWire;
use crate::relay::Relay;
use crate::server::{full, BoxBody};

const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full(body.to_string()))
        .expect("static response is always well formed")
}

pub fn root() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .body(full("OK"))
        .expect("static response is always well formed")
}

pub fn version() -> Response<BoxBody> {
    json_response(StatusCode::OK, json!({"version": CORE_VERSION}))
}

pub fn extension_status(relay: &Relay) -> Response<BoxBody> {
    let state = relay.store.get_state();
    let first = state.extensions.values().max_by_key(|e| e.seq);
    let body = match first {
        Some(entry) => json!({
            "connected": true,
            "stableKey": entry.stable_key,
            "targets": entry.connected_targets.len(),
        }),
        None => json!({"connected": false}),
    };
    json_response(StatusCode::OK, body)
}

pub fn extensions_status(relay: &Relay) -> Response<BoxBody> {
    let state = relay.store.get_state();
    let list: Vec<_> = state
        .extensions
        .values()
        .map(|entry| {
            json!({
                "id": entry.id,
                "stableKey": entry.stable_key,
                "targets": entry.connected_targets.len(),
                "ioLive": entry.io_live,
            })
        })
        .collect();
    json_response(StatusCode::OK, json!(list))
}

/// `GET|PUT /json`, `/json/list` (and trailing-slash variants): visible
/// targets on the default (fallback-selected) extension only.
pub fn json_list(relay: &Relay, host: &str) -> Response<BoxBody> {
    let state = relay.store.get_state();
    let allowlist = &relay.config.extension_origin_allowlist;

    let entry = crate::state::lookup::get_extension_connection(
        &state,
        None,
        crate::state::lookup::LookupOptions { allow_fallback: true },
    );

    let list: Vec<_> = entry
        .map(|entry| {
            entry
                .connected_targets
                .values()
                .filter(|t| !is_restricted(&t.target_info, allowlist))
                .map(|t| {
                    let wire = TargetInfoWire::from(&t.target_info);
                    json!({
                        "id": wire.target_id,
                        "type": wire.target_type,
                        "title": wire.title,
                        "description": "",
                        "url": wire.url,
                        "webSocketDebuggerUrl": format!("ws://{host}/cdp/{}", t.session_id),
                        "devtoolsFrontendUrl": format!(
                            "devtools://devtools/bundled/inspector.html?ws={host}/cdp/{}",
                            t.session_id
                        ),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    json_response(StatusCode::OK, json!(list))
}

/// `GET|PUT /json/version`: browser identification plus the base debugger URL.
pub fn json_version(host: &str) -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        json!({
            "Browser": format!("CDP-Relay-Core/{CORE_VERSION}"),
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": format!("ws://{host}/cdp"),
        }),
    )
}

pub fn not_found() -> Response<BoxBody> {
    json_response(StatusCode::NOT_FOUND, json!({"error": "not found"}))
}

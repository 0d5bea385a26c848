//! HTTP + WebSocket hosting (spec §2, §4.G, §4.H).
//!
//! The base crate never hosted a server over `hyper`, only a `tonic` gRPC
//! service; this module is the one genuinely new capability this crate
//! needs beyond the base crate's stack (see `SPEC_FULL.md` §2), built from
//! `hyper` 1.x + `hyper-util` (already present, unused, in the base
//! crate's `Cargo.toml`) plus `hyper-tungstenite` for the WebSocket
//! upgrades.

pub mod discovery;
pub mod security;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody as HttpBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_tungstenite::{is_upgrade_request, upgrade};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::relay::Relay;
use crate::session::{driver, extension};
use crate::state::ExtensionInfo;

pub type BoxBody = HttpBoxBody<Bytes, hyper::Error>;

pub fn full(body: impl Into<Bytes>) -> BoxBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((
                urlencoding::decode(key).ok()?.into_owned(),
                urlencoding::decode(value).ok()?.into_owned(),
            ))
        })
        .collect()
}

fn error_response(err: &Error) -> Response<BoxBody> {
    Response::builder()
        .status(err.http_status())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full(serde_json::json!({"error": err.to_string()}).to_string()))
        .expect("static response is always well formed")
}

/// Bind `relay.config.host:port` and serve forever, one task per
/// connection (spec §2 "single OS process hosting an HTTP+WebSocket
/// server on a loopback address").
pub async fn serve(relay: Arc<Relay>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", relay.config.host, relay.config.port)
        .parse()
        .map_err(Error::from)?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "cdp relay core listening");
    serve_listener(listener, relay).await
}

/// Serve forever over an already-bound listener. Split out of `serve` so
/// tests can bind `127.0.0.1:0`, read back the OS-assigned port, and drive
/// real sockets against it.
pub async fn serve_listener(listener: TcpListener, relay: Arc<Relay>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req| {
                let relay = relay.clone();
                async move { route(req, relay, peer).await }
            });
            if let Err(err) = ConnBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                warn!(%err, "connection closed with error");
            }
        });
    }
}

async fn route(
    req: Request<Incoming>,
    relay: Arc<Relay>,
    peer: SocketAddr,
) -> std::result::Result<Response<BoxBody>, Infallible> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let response = if path == "/extension" {
        handle_extension_upgrade(req, relay, peer, &query).await
    } else if path == "/cdp" || path.starts_with("/cdp/") {
        handle_driver_upgrade(req, relay, peer, &path, &query).await
    } else if path.starts_with("/cli/") || path.starts_with("/recording/") {
        handle_privileged(req, &relay, &query)
    } else {
        Ok(handle_discovery(req, &relay, &path, &query))
    };

    Ok(response.unwrap_or_else(|err| {
        error!(%err, path = %path, "request rejected");
        error_response(&err)
    }))
}

async fn handle_extension_upgrade(
    mut req: Request<Incoming>,
    relay: Arc<Relay>,
    peer: SocketAddr,
    query: &str,
) -> Result<Response<BoxBody>> {
    if !is_upgrade_request(&req) {
        return Err(Error::BadRequest("/extension requires a WebSocket upgrade".into()));
    }
    security::check_extension_upgrade(&req, peer, &relay.config)?;

    let params = parse_query(query);
    let info = ExtensionInfo {
        browser: params.get("browser").cloned(),
        email: params.get("email").cloned(),
        profile_id: params.get("id").cloned(),
        version: params.get("v").cloned(),
    };

    let (response, websocket) =
        upgrade(&mut req, None).map_err(|err| Error::websocket(err.to_string()))?;

    let id = crate::state::new_connection_id();
    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => extension::run_extension_session(ws, id, info, relay).await,
            Err(err) => warn!(%err, "extension websocket upgrade failed"),
        }
    });

    Ok(response.map(|_: Empty<Bytes>| empty()))
}

async fn handle_driver_upgrade(
    mut req: Request<Incoming>,
    relay: Arc<Relay>,
    peer: SocketAddr,
    path: &str,
    query: &str,
) -> Result<Response<BoxBody>> {
    let _ = peer;
    if !is_upgrade_request(&req) {
        return Err(Error::BadRequest("/cdp requires a WebSocket upgrade".into()));
    }

    let params = parse_query(query);
    security::check_driver_upgrade(&req, &relay.config, params.get("token").map(String::as_str))?;

    let client_id = path
        .strip_prefix("/cdp/")
        .filter(|s| !s.is_empty())
        .unwrap_or("default")
        .to_string();
    let extension_id = params.get("extensionId").cloned();

    let (response, websocket) =
        upgrade(&mut req, None).map_err(|err| Error::websocket(err.to_string()))?;

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => driver::run_driver_session(ws, client_id, extension_id, relay).await,
            Err(err) => warn!(%err, "driver websocket upgrade failed"),
        }
    });

    Ok(response.map(|_: Empty<Bytes>| empty()))
}

fn handle_privileged(req: Request<Incoming>, relay: &Relay, query: &str) -> Result<Response<BoxBody>> {
    let params = parse_query(query);
    security::check_privileged_request(&req, &relay.config, params.get("token").map(String::as_str))?;
    // Out of scope (spec §1): CLI and recording collaborators own the
    // actual behavior; the Core only needs to gate the route.
    Ok(Response::builder()
        .status(StatusCode::NOT_IMPLEMENTED)
        .body(full("{}"))
        .expect("static response is always well formed"))
}

fn handle_discovery(req: Request<Incoming>, relay: &Relay, path: &str, query: &str) -> Response<BoxBody> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    let _ = query;

    match (req.method(), path) {
        (&Method::GET, "/") => discovery::root(),
        (&Method::GET, "/version") => discovery::version(),
        (&Method::GET, "/extension/status") => discovery::extension_status(relay),
        (&Method::GET, "/extensions/status") => discovery::extensions_status(relay),
        (&Method::GET | &Method::PUT, "/json" | "/json/" | "/json/list" | "/json/list/") => {
            discovery::json_list(relay, &host)
        }
        (&Method::GET | &Method::PUT, "/json/version" | "/json/version/") => discovery::json_version(&host),
        _ => discovery::not_found(),
    }
}

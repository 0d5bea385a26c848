//! Security gates (spec §4.H): origin allow-lists, loopback binding,
//! shared-token checks and the privileged-route CSRF gate.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use hyper::body::Incoming;
use hyper::Request;

use crate::config::Config;
use crate::error::{Error, Result};

/// Extract the `chrome-extension://<id>` origin id, if present and well
/// formed. Returns `Ok(None)` when no `Origin` header was sent at all
/// (spec §4.D gate 1: absent origin is allowed for non-browser clients).
pub fn extension_origin_id(req: &Request<Incoming>) -> Result<Option<String>> {
    let Some(origin) = req.headers().get(hyper::header::ORIGIN) else {
        return Ok(None);
    };
    let origin = origin
        .to_str()
        .map_err(|_| Error::BadRequest("origin header is not valid UTF-8".into()))?;
    let id = origin
        .strip_prefix("chrome-extension://")
        .ok_or_else(|| Error::Forbidden("origin is not a chrome-extension:// origin".into()))?;
    Ok(Some(id.to_string()))
}

fn origin_allowed(id: &str, allowlist: &[String]) -> bool {
    allowlist.iter().any(|allowed| allowed == id)
}

/// Extract `Authorization: Bearer <token>`, if present and well formed.
fn bearer_token(req: &Request<Incoming>) -> Option<String> {
    let value = req.headers().get(hyper::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|token| token.to_string())
}

/// `/extension` gate: remote address must be loopback; origin must be
/// present, `chrome-extension://`, and allow-listed.
pub fn check_extension_upgrade(req: &Request<Incoming>, peer: SocketAddr, config: &Config) -> Result<()> {
    if !is_loopback(peer.ip()) {
        return Err(Error::Forbidden("extension connections must originate from loopback".into()));
    }
    match extension_origin_id(req)? {
        Some(id) if origin_allowed(&id, &config.extension_origin_allowlist) => Ok(()),
        Some(_) => Err(Error::Forbidden("extension origin not in allow-list".into())),
        None => Err(Error::Forbidden("extension connections must send an Origin header".into())),
    }
}

/// `/cdp` gates 1-2 (spec §4.D): origin, if present, must be allow-listed;
/// token, if configured, must match exactly, given either as `?token=` or
/// as an `Authorization: Bearer` header (spec §4.H).
pub fn check_driver_upgrade(req: &Request<Incoming>, config: &Config, token: Option<&str>) -> Result<()> {
    if let Some(id) = extension_origin_id(req)? {
        if !origin_allowed(&id, &config.extension_origin_allowlist) {
            return Err(Error::Forbidden("driver origin not in allow-list".into()));
        }
    }
    let bearer = bearer_token(req);
    let effective_token = token.or(bearer.as_deref());
    if config.token_required() && !config.token_matches(effective_token) {
        return Err(Error::Unauthorized("missing or incorrect token".into()));
    }
    Ok(())
}

/// Privileged HTTP routes (`/cli/*`, `/recording/*`): reject cross-origin
/// browser POSTs, require an exact-match `Content-Type`, and require the
/// token as either `?token=` or an `Authorization: Bearer` header.
pub fn check_privileged_request(req: &Request<Incoming>, config: &Config, token: Option<&str>) -> Result<()> {
    if let Some(site) = req.headers().get("sec-fetch-site") {
        let site = site.to_str().unwrap_or("");
        if site != "same-origin" && site != "none" {
            return Err(Error::Forbidden("cross-origin privileged request rejected".into()));
        }
    }
    if req.method() == hyper::Method::POST {
        let content_type = req
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("application/json") {
            return Err(Error::unsupported_media_type("privileged POST requires application/json"));
        }
    }
    let bearer = bearer_token(req);
    let effective_token = token.or(bearer.as_deref());
    if config.token_required() && !config.token_matches(effective_token) {
        return Err(Error::Unauthorized("missing or incorrect token".into()));
    }
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST || v6.to_ipv4_mapped().map(|v4| v4.is_loopback()).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_detection_covers_v4_and_v6() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(!is_loopback("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn origin_allowlist_matches_exact_id() {
        let allowlist = vec!["abc".to_string()];
        assert!(origin_allowed("abc", &allowlist));
        assert!(!origin_allowed("xyz", &allowlist));
    }
}

//! Wire types for both sides of the relay (spec §6).
//!
//! Dynamic CDP payloads with arbitrary `params` are modeled as opaque
//! `serde_json::Value`s for everything the relay doesn't emulate or
//! rewrite; only the small subset of methods the emulator (`cdp::emulator`)
//! and translator (`cdp::translator`) actually touch get their own typed
//! structs, per spec §9's design note.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Driver-facing wire types (`/cdp[/clientId]`)
// ---------------------------------------------------------------------------

/// A CDP command frame from a driver.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverCommand {
    pub id: u64,
    #[serde(default)]
    pub session_id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub source: Option<String>,
}

/// The `error` field of a driver-facing response.
#[derive(Debug, Clone, Serialize)]
pub struct DriverError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
}

/// A response frame sent back to a driver, matched by `id`.
#[derive(Debug, Clone, Serialize)]
pub struct DriverResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
}

impl DriverResponse {
    pub fn ok(id: u64, session_id: Option<String>, result: Value) -> Self {
        Self {
            id,
            session_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, session_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            session_id,
            result: None,
            error: Some(DriverError {
                code: None,
                message: message.into(),
            }),
        }
    }
}

/// An event frame sent (synthesized or forwarded) to a driver.
#[derive(Debug, Clone, Serialize)]
pub struct DriverEvent {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub params: Value,
    #[serde(rename = "__serverGenerated", skip_serializing_if = "Option::is_none")]
    pub server_generated: Option<bool>,
}

impl DriverEvent {
    pub fn forwarded(method: impl Into<String>, session_id: Option<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            session_id,
            params,
            server_generated: None,
        }
    }

    pub fn synthesized(method: impl Into<String>, session_id: Option<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            session_id,
            params,
            server_generated: Some(true),
        }
    }
}

// ---------------------------------------------------------------------------
// Extension-facing wire types (`/extension`)
// ---------------------------------------------------------------------------

/// A request sent from the Core to the extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionRequest {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Parameters of an outbound `forwardCDPCommand` request.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardCdpCommandParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub method: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A decoded inbound text frame from the extension (spec §4.C, §6).
#[derive(Debug, Clone)]
pub enum ExtensionInbound {
    /// A response to a previously allocated outbound message id.
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<String>,
    },
    /// Keep-alive reply.
    Pong,
    /// A log line to forward to the configured logger.
    Log { level: String, args: Vec<String> },
    /// Recording payload / cancellation (handed off out-of-scope).
    RecordingData(Value),
    RecordingCancelled(Value),
    /// A CDP event forwarded from an attached tab.
    ForwardCdpEvent {
        method: String,
        session_id: Option<String>,
        params: Value,
    },
    /// A frame with a `method` this relay doesn't recognize; forwarded
    /// nowhere, logged and ignored.
    UnknownMethod(String),
}

impl ExtensionInbound {
    /// Parse one inbound text frame. Spec: "Malformed JSON: close the
    /// socket with code 1000 and reason 'Invalid JSON'" — callers should
    /// treat a parse error that way rather than dropping the frame (that
    /// rule is specific to the extension side; the driver side drops
    /// malformed frames silently instead).
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(Error::from)?;

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let result = value.get("result").cloned();
            let error = value
                .get("error")
                .and_then(|e| e.as_str().map(|s| s.to_string()))
                .or_else(|| value.get("error").map(|e| e.to_string()));
            return Ok(ExtensionInbound::Response { id, result, error });
        }

        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest("frame has neither id nor method".into()))?;

        let params = value.get("params").cloned().unwrap_or(Value::Null);

        Ok(match method {
            "pong" => ExtensionInbound::Pong,
            "log" => {
                let level = params
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("info")
                    .to_string();
                let args = params
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().map(|v| v.to_string()).collect())
                    .unwrap_or_default();
                ExtensionInbound::Log { level, args }
            }
            "recordingData" => ExtensionInbound::RecordingData(params),
            "recordingCancelled" => ExtensionInbound::RecordingCancelled(params),
            "forwardCDPEvent" => {
                let inner_method = params
                    .get("method")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::BadRequest("forwardCDPEvent missing method".into()))?
                    .to_string();
                let session_id = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string());
                let inner_params = params.get("params").cloned().unwrap_or(Value::Null);
                ExtensionInbound::ForwardCdpEvent {
                    method: inner_method,
                    session_id,
                    params: inner_params,
                }
            }
            other => ExtensionInbound::UnknownMethod(other.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// CDP `Target.TargetInfo` wire shape and conversions
// ---------------------------------------------------------------------------

/// CDP `Target.TargetInfo` as received from the extension.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetInfoWire {
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(rename = "waitingForDebugger", default)]
    pub waiting_for_debugger: bool,
    #[serde(rename = "parentFrameId", default)]
    pub parent_frame_id: Option<String>,
}

impl From<TargetInfoWire> for crate::state::TargetInfo {
    fn from(wire: TargetInfoWire) -> Self {
        crate::state::TargetInfo {
            target_id: wire.target_id,
            r#type: wire.target_type,
            title: wire.title,
            url: wire.url,
            attached: wire.attached,
            waiting_for_debugger: wire.waiting_for_debugger,
            parent_frame_id: wire.parent_frame_id,
        }
    }
}

impl From<&crate::state::TargetInfo> for TargetInfoWire {
    fn from(info: &crate::state::TargetInfo) -> Self {
        TargetInfoWire {
            target_id: info.target_id.clone(),
            target_type: info.r#type.clone(),
            title: info.title.clone(),
            url: info.url.clone(),
            attached: info.attached,
            waiting_for_debugger: info.waiting_for_debugger,
            parent_frame_id: info.parent_frame_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_response_frame() {
        let frame = ExtensionInbound::parse(r#"{"id":3,"result":{"ok":true}}"#).unwrap();
        match frame {
            ExtensionInbound::Response { id, result, error } => {
                assert_eq!(id, 3);
                assert!(result.is_some());
                assert!(error.is_none());
            }
            _ => panic!("expected Response"),
        }
    }

    #[test]
    fn parses_forward_cdp_event() {
        let frame = ExtensionInbound::parse(
            r#"{"method":"forwardCDPEvent","params":{"method":"Target.attachedToTarget","sessionId":"pw-tab-1","params":{"foo":1}}}"#,
        )
        .unwrap();
        match frame {
            ExtensionInbound::ForwardCdpEvent { method, session_id, .. } => {
                assert_eq!(method, "Target.attachedToTarget");
                assert_eq!(session_id.as_deref(), Some("pw-tab-1"));
            }
            _ => panic!("expected ForwardCdpEvent"),
        }
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(ExtensionInbound::parse("not json").is_err());
    }

    #[test]
    fn pong_and_unknown_methods_decode() {
        assert!(matches!(
            ExtensionInbound::parse(r#"{"method":"pong"}"#).unwrap(),
            ExtensionInbound::Pong
        ));
        assert!(matches!(
            ExtensionInbound::parse(r#"{"method":"somethingElse"}"#).unwrap(),
            ExtensionInbound::UnknownMethod(_)
        ));
    }
}

//! Event translator (spec §4.F): consumes extension-forwarded CDP events,
//! mutates state, and re-emits to the correct driver(s) with iframe
//! session re-parenting.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::cdp::wire::{DriverEvent, TargetInfoWire};
use crate::cdp::is_restricted;
use crate::events::RelayEvent;
use crate::relay::Relay;
use crate::session::extension::notify_extension;
use crate::state::{ClientId, RelayState, TargetInfo};

/// Handle one `forwardCDPEvent` payload from an extension.
pub async fn handle_forwarded_event(
    relay: Arc<Relay>,
    extension_id: String,
    method: String,
    session_id: Option<String>,
    params: Value,
) {
    relay.events.publish(RelayEvent::CdpEvent {
        extension_id: extension_id.clone(),
        session_id: session_id.clone(),
        method: method.clone(),
        params: params.clone(),
        server_generated: false,
    });

    match method.as_str() {
        "Target.attachedToTarget" => attached_to_target(&relay, &extension_id, params).await,
        "Target.detachedFromTarget" => {
            if let Some(detached_session) = params.get("sessionId").and_then(Value::as_str) {
                relay
                    .store
                    .set_state(|s| s.remove_target(&extension_id, detached_session));
            }
            forward(&relay, &extension_id, &method, session_id, params).await;
        }
        "Target.targetCrashed" => {
            if let Some(target_id) = params.get("targetId").and_then(Value::as_str) {
                relay
                    .store
                    .set_state(|s| s.remove_target_by_crash(&extension_id, target_id));
            }
            forward(&relay, &extension_id, &method, session_id, params).await;
        }
        "Target.targetInfoChanged" => {
            if let Some(info) = params.get("targetInfo") {
                if let Ok(wire) = serde_json::from_value::<TargetInfoWire>(info.clone()) {
                    let target_id = wire.target_id.clone();
                    let resolved_session = session_id
                        .clone()
                        .or_else(|| session_for_target(&relay.store.get_state(), &extension_id, &target_id));
                    if let Some(owner_session) = &resolved_session {
                        let target_info: TargetInfo = wire.into();
                        relay
                            .store
                            .set_state(|s| s.update_target_info(&extension_id, owner_session, target_info.clone()));
                    }
                }
            }
            forward(&relay, &extension_id, &method, session_id, params).await;
        }
        "Page.frameAttached" => {
            if let (Some(session_id), Some(frame_id)) = (&session_id, params.get("frameId").and_then(Value::as_str)) {
                relay
                    .store
                    .set_state(|s| s.add_frame_id(&extension_id, session_id, frame_id.to_string()));
            }
            forward(&relay, &extension_id, &method, session_id, params).await;
        }
        "Page.frameDetached" => {
            if let Some(frame_id) = params.get("frameId").and_then(Value::as_str) {
                relay.store.set_state(|s| s.remove_frame_id(&extension_id, frame_id));
            }
            forward(&relay, &extension_id, &method, session_id, params).await;
        }
        "Page.frameNavigated" => {
            if let Some(frame) = params.get("frame") {
                let frame_id = frame.get("id").and_then(Value::as_str).map(|s| s.to_string());
                let parent_id = frame.get("parentId").and_then(Value::as_str);
                let url = frame.get("url").and_then(Value::as_str).map(|s| s.to_string());
                let name = frame.get("name").and_then(Value::as_str).map(|s| s.to_string());
                if let (Some(session_id), Some(frame_id)) = (&session_id, &frame_id) {
                    relay
                        .store
                        .set_state(|s| s.add_frame_id(&extension_id, session_id, frame_id.clone()));
                    if parent_id.is_none() {
                        if let Some(url) = url {
                            relay
                                .store
                                .set_state(|s| s.update_target_url(&extension_id, session_id, url.clone(), name.clone()));
                        }
                    }
                }
            }
            forward(&relay, &extension_id, &method, session_id, params).await;
        }
        "Page.navigatedWithinDocument" => {
            if let (Some(session_id), Some(url)) = (&session_id, params.get("url").and_then(Value::as_str)) {
                relay
                    .store
                    .set_state(|s| s.update_target_url(&extension_id, session_id, url.to_string(), None));
            }
            forward(&relay, &extension_id, &method, session_id, params).await;
        }
        _ => {
            forward(&relay, &extension_id, &method, session_id, params).await;
        }
    }
}

async fn attached_to_target(relay: &Arc<Relay>, extension_id: &str, params: Value) {
    let Some(session_id) = params.get("sessionId").and_then(Value::as_str).map(|s| s.to_string()) else {
        debug!(extension_id, "Target.attachedToTarget missing sessionId, dropped");
        return;
    };
    let Some(target_info_value) = params.get("targetInfo") else {
        debug!(extension_id, "Target.attachedToTarget missing targetInfo, dropped");
        return;
    };
    let Ok(wire) = serde_json::from_value::<TargetInfoWire>(target_info_value.clone()) else {
        debug!(extension_id, "Target.attachedToTarget targetInfo unparsable, dropped");
        return;
    };
    let waiting_for_debugger = params
        .get("waitingForDebugger")
        .and_then(Value::as_bool)
        .unwrap_or(wire.waiting_for_debugger);
    let target_info: TargetInfo = wire.into();
    let restricted = is_restricted(&target_info, &relay.config.extension_origin_allowlist);

    let is_new = !restricted
        && relay
            .store
            .get_state()
            .extensions
            .get(extension_id)
            .map(|e| !e.connected_targets.contains_key(&session_id))
            .unwrap_or(true);

    if !restricted {
        relay
            .store
            .set_state(|s| s.add_target(extension_id, session_id.clone(), target_info.clone()));
    }

    if waiting_for_debugger {
        notify_extension(
            relay.clone(),
            extension_id.to_string(),
            session_id.clone(),
            "Runtime.runIfWaitingForDebugger",
        );
    }

    if restricted || !is_new {
        return;
    }

    let outer_session = if target_info.r#type == "iframe" {
        target_info
            .parent_frame_id
            .as_deref()
            .and_then(|parent_frame_id| owning_session_for_frame(&relay.store.get_state(), extension_id, parent_frame_id))
            .unwrap_or_else(|| session_id.clone())
    } else {
        session_id.clone()
    };

    let event = DriverEvent::forwarded(
        "Target.attachedToTarget",
        Some(outer_session),
        params,
    );
    fan_out(relay, extension_id, event).await;
}

fn owning_session_for_frame(state: &RelayState, extension_id: &str, frame_id: &str) -> Option<String> {
    state
        .extensions
        .get(extension_id)?
        .connected_targets
        .values()
        .find(|t| t.frame_ids.contains(frame_id))
        .map(|t| t.session_id.clone())
}

fn session_for_target(state: &RelayState, extension_id: &str, target_id: &str) -> Option<String> {
    state
        .extensions
        .get(extension_id)?
        .connected_targets
        .values()
        .find(|t| t.target_id == target_id)
        .map(|t| t.session_id.clone())
}

async fn forward(relay: &Relay, extension_id: &str, method: &str, session_id: Option<String>, params: Value) {
    let event = DriverEvent::forwarded(method, session_id, params);
    fan_out(relay, extension_id, event).await;
}

/// Fan-out rule (spec §4.F): deliver only to driver clients bound to the
/// source extension.
async fn fan_out(relay: &Relay, extension_id: &str, event: DriverEvent) {
    let clients: Vec<ClientId> = relay
        .store
        .get_state()
        .playwright_clients
        .values()
        .filter(|c| c.extension_id.as_deref() == Some(extension_id))
        .map(|c| c.id.clone())
        .collect();
    for client_id in clients {
        relay.drivers.send_event(&client_id, event.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::ExtensionInfo;
    use serde_json::json;

    fn iframe_target(id: &str, parent_frame_id: &str) -> TargetInfo {
        TargetInfo {
            target_id: id.to_string(),
            r#type: "iframe".to_string(),
            title: String::new(),
            url: "https://embedded.example".to_string(),
            attached: true,
            waiting_for_debugger: false,
            parent_frame_id: Some(parent_frame_id.to_string()),
        }
    }

    #[test]
    fn owning_session_for_frame_finds_the_target_holding_it() {
        let state = RelayState::new().add_extension("e1".into(), ExtensionInfo::default());
        let state = state.add_target(
            "e1",
            "s1".into(),
            TargetInfo {
                target_id: "t1".into(),
                r#type: "page".into(),
                title: String::new(),
                url: "https://a".into(),
                attached: true,
                waiting_for_debugger: false,
                parent_frame_id: None,
            },
        );
        let state = state.add_frame_id("e1", "s1", "f1".into());
        assert_eq!(owning_session_for_frame(&state, "e1", "f1"), Some("s1".to_string()));
        assert_eq!(owning_session_for_frame(&state, "e1", "unknown"), None);
    }

    #[test]
    fn session_for_target_looks_up_by_target_id() {
        let state = RelayState::new().add_extension("e1".into(), ExtensionInfo::default());
        let state = state.add_target(
            "e1",
            "s1".into(),
            TargetInfo {
                target_id: "t1".into(),
                r#type: "page".into(),
                title: String::new(),
                url: "https://a".into(),
                attached: true,
                waiting_for_debugger: false,
                parent_frame_id: None,
            },
        );
        assert_eq!(session_for_target(&state, "e1", "t1"), Some("s1".to_string()));
        assert_eq!(session_for_target(&state, "e1", "missing"), None);
    }

    #[tokio::test]
    async fn attached_to_target_registers_a_new_page_session() {
        let relay = Relay::new(Config::default());
        relay
            .store
            .set_state(|s| s.add_extension("e1".into(), ExtensionInfo::default()));

        let params = json!({
            "sessionId": "s1",
            "waitingForDebugger": false,
            "targetInfo": {
                "targetId": "t1",
                "type": "page",
                "title": "",
                "url": "https://example.com",
                "attached": true,
            },
        });
        handle_forwarded_event(relay.clone(), "e1".into(), "Target.attachedToTarget".into(), None, params).await;

        let state = relay.store.get_state();
        assert!(state.extensions["e1"].connected_targets.contains_key("s1"));
    }

    #[tokio::test]
    async fn attached_to_target_drops_restricted_targets() {
        let relay = Relay::new(Config::default());
        relay
            .store
            .set_state(|s| s.add_extension("e1".into(), ExtensionInfo::default()));

        let params = json!({
            "sessionId": "s1",
            "waitingForDebugger": false,
            "targetInfo": {
                "targetId": "t1",
                "type": "page",
                "title": "",
                "url": "chrome://settings",
                "attached": true,
            },
        });
        handle_forwarded_event(relay.clone(), "e1".into(), "Target.attachedToTarget".into(), None, params).await;

        let state = relay.store.get_state();
        assert!(state.extensions["e1"].connected_targets.is_empty());
    }

    #[tokio::test]
    async fn frame_attached_then_detached_updates_frame_ids() {
        let relay = Relay::new(Config::default());
        relay
            .store
            .set_state(|s| s.add_extension("e1".into(), ExtensionInfo::default()));
        relay
            .store
            .set_state(|s| s.add_target("e1", "s1".into(), iframe_target("t1", "f-parent")));

        handle_forwarded_event(
            relay.clone(),
            "e1".into(),
            "Page.frameAttached".into(),
            Some("s1".into()),
            json!({"frameId": "f1", "parentFrameId": "f-parent"}),
        )
        .await;
        assert!(relay.store.get_state().extensions["e1"].connected_targets["s1"]
            .frame_ids
            .contains("f1"));

        handle_forwarded_event(
            relay.clone(),
            "e1".into(),
            "Page.frameDetached".into(),
            Some("s1".into()),
            json!({"frameId": "f1"}),
        )
        .await;
        assert!(!relay.store.get_state().extensions["e1"].connected_targets["s1"]
            .frame_ids
            .contains("f1"));
    }
}

//! CDP emulator (spec §4.E): handles a small, compatibility-critical
//! subset of CDP locally; forwards everything else to the owning
//! extension.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::cdp::is_restricted;
use crate::cdp::wire::{DriverCommand, DriverEvent, TargetInfoWire};
use crate::error::{Error, Result};
use crate::events::RelayEvent;
use crate::relay::Relay;
use crate::session::extension::forward_cdp_command;
use crate::state::TargetInfo;

const PROTOCOL_VERSION: &str = "1.3";

/// Dispatch one driver command for `client_id`, bound to `extension_id`.
pub async fn handle_command(relay: &Relay, extension_id: &str, client_id: &str, cmd: &DriverCommand) -> Result<Value> {
    match cmd.method.as_str() {
        "Browser.getVersion" => Ok(browser_get_version()),
        "Browser.setDownloadBehavior" => Ok(json!({})),
        "Target.setAutoAttach" if cmd.session_id.is_none() => {
            set_auto_attach(relay, extension_id, client_id, cmd).await
        }
        "Target.setDiscoverTargets" => set_discover_targets(relay, extension_id, client_id, cmd).await,
        "Target.attachToTarget" => attach_to_target(relay, extension_id, client_id, cmd).await,
        "Target.getTargetInfo" => get_target_info(relay, extension_id, cmd),
        "Target.getTargets" => get_targets(relay, extension_id),
        "Runtime.enable" if cmd.session_id.is_some() => runtime_enable(relay, extension_id, cmd).await,
        _ => {
            forward_cdp_command(
                relay,
                extension_id,
                cmd.session_id.clone(),
                &cmd.method,
                cmd.params.clone(),
                cmd.source.clone(),
            )
            .await
        }
    }
}

fn browser_get_version() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "product": "Chrome/CDP-Relay-Core",
        "revision": "1",
        "userAgent": "CDP-Relay-Core/1.0",
        "jsVersion": "0",
    })
}

async fn set_auto_attach(relay: &Relay, extension_id: &str, client_id: &str, cmd: &DriverCommand) -> Result<Value> {
    forward_cdp_command(relay, extension_id, None, &cmd.method, cmd.params.clone(), cmd.source.clone()).await?;

    let auto_attach = cmd
        .params
        .get("autoAttach")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if relay.config.auto_tab && auto_attach {
        let has_targets = relay
            .store
            .get_state()
            .extensions
            .get(extension_id)
            .map(|e| !e.connected_targets.is_empty())
            .unwrap_or(false);
        if !has_targets {
            create_initial_tab(relay, extension_id).await?;
        }
    }

    replay_attached_targets(relay, extension_id, client_id).await;
    Ok(json!({}))
}

/// Request an initial tab from the extension and fold it into state
/// directly, rather than waiting on the extension's own `forwardCDPEvent`
/// round-trip, so the subsequent replay below sees it immediately.
async fn create_initial_tab(relay: &Relay, extension_id: &str) -> Result<()> {
    let created = forward_cdp_command(
        relay,
        extension_id,
        None,
        "Target.createTarget",
        json!({"url": "about:blank"}),
        None,
    )
    .await?;

    let target_id = created
        .get("targetId")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::cdp("Target.createTarget response missing targetId"))?
        .to_string();

    let session_id = format!("pw-auto-{}", Uuid::new_v4());
    let target_info = TargetInfo {
        target_id,
        r#type: "page".to_string(),
        title: String::new(),
        url: "about:blank".to_string(),
        attached: true,
        waiting_for_debugger: false,
        parent_frame_id: None,
    };
    relay
        .store
        .set_state(|s| s.add_target(extension_id, session_id.clone(), target_info.clone()));
    Ok(())
}

async fn replay_attached_targets(relay: &Relay, extension_id: &str, client_id: &str) {
    let state = relay.store.get_state();
    let Some(entry) = state.extensions.get(extension_id) else {
        return;
    };
    let non_restricted: Vec<_> = entry
        .connected_targets
        .values()
        .filter(|t| !is_restricted(&t.target_info, &relay.config.extension_origin_allowlist))
        .cloned()
        .collect();
    for target in non_restricted {
        let wire = TargetInfoWire::from(&target.target_info);
        let params = json!({
            "sessionId": target.session_id,
            "targetInfo": wire,
            "waitingForDebugger": false,
        });
        let event = DriverEvent::synthesized("Target.attachedToTarget", None, params);
        relay.drivers.send_event(client_id, event).await;
    }
}

async fn set_discover_targets(relay: &Relay, extension_id: &str, client_id: &str, cmd: &DriverCommand) -> Result<Value> {
    let discover = cmd.params.get("discover").and_then(Value::as_bool).unwrap_or(false);
    if !discover {
        return forward_cdp_command(
            relay,
            extension_id,
            cmd.session_id.clone(),
            &cmd.method,
            cmd.params.clone(),
            cmd.source.clone(),
        )
        .await;
    }

    let state = relay.store.get_state();
    if let Some(entry) = state.extensions.get(extension_id) {
        for target in entry.connected_targets.values() {
            if is_restricted(&target.target_info, &relay.config.extension_origin_allowlist) {
                continue;
            }
            let wire = TargetInfoWire::from(&target.target_info);
            let event = DriverEvent::synthesized("Target.targetCreated", None, json!({"targetInfo": wire}));
            relay.drivers.send_event(client_id, event).await;
        }
    }
    Ok(json!({}))
}

async fn attach_to_target(relay: &Relay, extension_id: &str, client_id: &str, cmd: &DriverCommand) -> Result<Value> {
    let target_id = cmd
        .params
        .get("targetId")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BadRequest("Target.attachToTarget missing targetId".into()))?;

    let state = relay.store.get_state();
    let found = state
        .extensions
        .get(extension_id)
        .and_then(|entry| entry.connected_targets.values().find(|t| t.target_id == target_id).cloned());

    match found {
        Some(target) => {
            let wire = TargetInfoWire::from(&target.target_info);
            let params = json!({
                "sessionId": target.session_id,
                "targetInfo": wire,
                "waitingForDebugger": false,
            });
            let event = DriverEvent::synthesized("Target.attachedToTarget", None, params);
            relay.drivers.send_event(client_id, event).await;
            Ok(json!({"sessionId": target.session_id}))
        }
        None => Err(Error::target_not_found(target_id)),
    }
}

fn get_target_info(relay: &Relay, extension_id: &str, cmd: &DriverCommand) -> Result<Value> {
    let state = relay.store.get_state();
    let entry = state.extensions.get(extension_id).ok_or(Error::NoExtension)?;

    let target = if let Some(target_id) = cmd.params.get("targetId").and_then(Value::as_str) {
        entry.connected_targets.values().find(|t| t.target_id == target_id)
    } else if let Some(session_id) = &cmd.session_id {
        entry.connected_targets.get(session_id)
    } else {
        entry.connected_targets.values().next()
    };

    match target {
        Some(target) => Ok(json!({"targetInfo": TargetInfoWire::from(&target.target_info)})),
        None => Err(Error::target_not_found("no matching target")),
    }
}

fn get_targets(relay: &Relay, extension_id: &str) -> Result<Value> {
    let state = relay.store.get_state();
    let entry = state.extensions.get(extension_id).ok_or(Error::NoExtension)?;

    let infos: Vec<TargetInfoWire> = entry
        .connected_targets
        .values()
        .filter(|t| !is_restricted(&t.target_info, &relay.config.extension_origin_allowlist))
        .map(|t| {
            let mut wire = TargetInfoWire::from(&t.target_info);
            wire.attached = true;
            wire
        })
        .collect();

    Ok(json!({"targetInfos": infos}))
}

async fn runtime_enable(relay: &Relay, extension_id: &str, cmd: &DriverCommand) -> Result<Value> {
    let session_id = cmd.session_id.clone();
    let result = forward_cdp_command(
        relay,
        extension_id,
        session_id.clone(),
        &cmd.method,
        cmd.params.clone(),
        cmd.source.clone(),
    )
    .await?;

    let mut rx = relay.events.subscribe();
    let wait = Duration::from_millis(relay.config.runtime_enable_wait_ms);
    let waited = tokio::time::timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(RelayEvent::CdpEvent {
                    extension_id: ev_ext,
                    session_id: ev_session,
                    method,
                    params,
                    ..
                }) if ev_ext == extension_id
                    && ev_session == session_id
                    && method == "Runtime.executionContextCreated"
                    && params
                        .get("context")
                        .and_then(|c| c.get("auxData"))
                        .and_then(|a| a.get("isDefault"))
                        .and_then(Value::as_bool)
                        .unwrap_or(true) =>
                {
                    return;
                }
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    })
    .await;

    if waited.is_err() {
        debug!(extension_id, "Runtime.enable execution-context wait timed out, proceeding anyway");
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::Relay;
    use crate::state::ExtensionInfo;

    fn target(id: &str, url: &str) -> TargetInfo {
        TargetInfo {
            target_id: id.to_string(),
            r#type: "page".to_string(),
            title: String::new(),
            url: url.to_string(),
            attached: true,
            waiting_for_debugger: false,
            parent_frame_id: None,
        }
    }

    #[test]
    fn browser_get_version_reports_relay_identity() {
        let v = browser_get_version();
        assert_eq!(v["protocolVersion"], PROTOCOL_VERSION);
        assert!(v["product"].as_str().unwrap().contains("CDP-Relay-Core"));
    }

    #[test]
    fn get_targets_excludes_restricted_and_marks_attached() {
        let relay = Relay::new(Config::default());
        relay
            .store
            .set_state(|s| s.add_extension("e1".into(), ExtensionInfo::default()));
        relay
            .store
            .set_state(|s| s.add_target("e1", "s1".into(), target("t1", "https://example.com")));
        relay
            .store
            .set_state(|s| s.add_target("e1", "s2".into(), target("t2", "chrome://settings")));

        let result = get_targets(&relay, "e1").unwrap();
        let infos = result["targetInfos"].as_array().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0]["targetId"], "t1");
        assert_eq!(infos[0]["attached"], true);
    }

    #[test]
    fn get_target_info_falls_back_to_session_then_first_target() {
        let relay = Relay::new(Config::default());
        relay
            .store
            .set_state(|s| s.add_extension("e1".into(), ExtensionInfo::default()));
        relay
            .store
            .set_state(|s| s.add_target("e1", "s1".into(), target("t1", "https://example.com")));

        let cmd = DriverCommand {
            id: 1,
            method: "Target.getTargetInfo".into(),
            session_id: Some("s1".into()),
            params: json!({}),
            source: None,
        };
        let result = get_target_info(&relay, "e1", &cmd).unwrap();
        assert_eq!(result["targetInfo"]["targetId"], "t1");
    }

    #[test]
    fn get_target_info_unknown_extension_errors() {
        let relay = Relay::new(Config::default());
        let cmd = DriverCommand {
            id: 1,
            method: "Target.getTargetInfo".into(),
            session_id: None,
            params: json!({}),
            source: None,
        };
        assert!(get_target_info(&relay, "missing", &cmd).is_err());
    }
}

//! Routing & lookup helpers (spec §4.B): resolve a driver request to a
//! specific `ExtensionEntry`, and resolve CDP session ids back to their
//! owning extension.

use super::model::{ExtensionEntry, ExtensionId, RelayState, SessionId};

/// Find the newest `ExtensionEntry` whose `stable_key` matches `key` and
/// whose I/O side table is still live (invariant 3: newest is authoritative).
pub fn find_extension_by_stable_key<'a>(
    state: &'a RelayState,
    key: &str,
) -> Option<&'a ExtensionEntry> {
    state
        .extensions
        .values()
        .filter(|entry| entry.stable_key == key && entry.io_live)
        .max_by_key(|entry| entry.seq)
        .map(|entry| entry.as_ref())
}

/// Find the newest `ExtensionEntry` whose `stable_key` matches `key`,
/// regardless of I/O liveness — used during the reconnect grace window
/// where a lingering (replaced) entry must still resolve pending requests
/// tied to its own message ids (spec §5 replacement semantics).
pub fn find_extension_by_stable_key_any<'a>(
    state: &'a RelayState,
    key: &str,
) -> Option<&'a ExtensionEntry> {
    state
        .extensions
        .values()
        .filter(|entry| entry.stable_key == key)
        .max_by_key(|entry| entry.seq)
        .map(|entry| entry.as_ref())
}

/// Find the extension that owns a given CDP `sessionId`.
pub fn find_extension_id_by_cdp_session(state: &RelayState, session_id: &str) -> Option<ExtensionId> {
    state
        .extensions
        .values()
        .find(|entry| entry.connected_targets.contains_key(session_id))
        .map(|entry| entry.id.clone())
}

/// Options for `get_extension_connection` (spec §4.B).
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupOptions {
    pub allow_fallback: bool,
}

/// Resolve an extension connection for a driver request (spec §4.B
/// `getExtensionConnection`).
///
/// - If `id` is given, try it as a direct extension id, then as a stable
///   key (returning the newest live match).
/// - If `id` is absent and fallback is allowed: exactly one connected
///   extension wins outright; otherwise, if exactly one of several has at
///   least one `ConnectedTarget`, that one wins; otherwise `None`.
pub fn get_extension_connection<'a>(
    state: &'a RelayState,
    id: Option<&str>,
    options: LookupOptions,
) -> Option<&'a ExtensionEntry> {
    if let Some(id) = id {
        if let Some(entry) = state.extensions.get(id) {
            if entry.io_live {
                return Some(entry.as_ref());
            }
        }
        return find_extension_by_stable_key(state, id);
    }

    if !options.allow_fallback {
        return None;
    }

    let live: Vec<&ExtensionEntry> = state
        .extensions
        .values()
        .filter(|e| e.io_live)
        .map(|e| e.as_ref())
        .collect();

    match live.len() {
        0 => None,
        1 => Some(live[0]),
        _ => {
            let mut with_targets = live
                .into_iter()
                .filter(|e| !e.connected_targets.is_empty());
            let first = with_targets.next()?;
            if with_targets.next().is_some() {
                None
            } else {
                Some(first)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::ExtensionInfo;

    fn profile(p: &str) -> ExtensionInfo {
        ExtensionInfo {
            profile_id: Some(p.into()),
            ..Default::default()
        }
    }

    #[test]
    fn stable_key_lookup_returns_newest() {
        let state = RelayState::new()
            .add_extension("old".into(), profile("p1"))
            .update_extension_io("old", true)
            .add_extension("new".into(), profile("p1"));
        let found = find_extension_by_stable_key(&state, "profile:p1").unwrap();
        assert_eq!(found.id, "new");
    }

    #[test]
    fn single_extension_fallback_wins_without_id() {
        let state = RelayState::new().add_extension("only".into(), ExtensionInfo::default());
        let found = get_extension_connection(&state, None, LookupOptions { allow_fallback: true });
        assert_eq!(found.unwrap().id, "only");
    }

    #[test]
    fn multiple_extensions_require_a_unique_one_with_targets() {
        use crate::state::model::TargetInfo;
        let state = RelayState::new()
            .add_extension("a".into(), ExtensionInfo::default())
            .add_extension("b".into(), ExtensionInfo::default());
        // Neither has targets -> ambiguous.
        assert!(get_extension_connection(&state, None, LookupOptions { allow_fallback: true }).is_none());

        let state = state.add_target(
            "b",
            "pw-tab-1".into(),
            TargetInfo {
                target_id: "T1".into(),
                r#type: "page".into(),
                ..Default::default()
            },
        );
        let found = get_extension_connection(&state, None, LookupOptions { allow_fallback: true });
        assert_eq!(found.unwrap().id, "b");
    }

    #[test]
    fn no_fallback_without_explicit_id_returns_none() {
        let state = RelayState::new().add_extension("only".into(), ExtensionInfo::default());
        assert!(get_extension_connection(&state, None, LookupOptions::default()).is_none());
    }

    #[test]
    fn session_lookup_finds_owning_extension() {
        use crate::state::model::TargetInfo;
        let state = RelayState::new()
            .add_extension("e1".into(), ExtensionInfo::default())
            .add_target(
                "e1",
                "pw-tab-1".into(),
                TargetInfo {
                    target_id: "T1".into(),
                    ..Default::default()
                },
            );
        assert_eq!(
            find_extension_id_by_cdp_session(&state, "pw-tab-1"),
            Some("e1".to_string())
        );
        assert_eq!(find_extension_id_by_cdp_session(&state, "missing"), None);
    }
}

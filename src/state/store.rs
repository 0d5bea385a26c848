//! The relay state atom: pure transition functions plus a synchronous
//! subscriber mechanism (spec §4.A).
//!
//! Every `RelayState::with_*` method here is a pure function
//! `RelayState -> RelayState`: no I/O, no locking, no side effects. `Store`
//! is the only thing that actually holds a lock, and it takes that lock
//! only for the duration of cloning/replacing the snapshot — never across
//! an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::model::{
    ClientId, ConnectedTarget, ExtensionEntry, ExtensionId, ExtensionInfo, FrameId, MessageId,
    PlaywrightClient, RelayState, SessionId, TargetId, TargetInfo,
};

impl RelayState {
    fn with_extensions(
        &self,
        f: impl FnOnce(&mut HashMap<ExtensionId, Arc<ExtensionEntry>>),
    ) -> RelayState {
        let mut extensions = (*self.extensions).clone();
        f(&mut extensions);
        RelayState {
            extensions: Arc::new(extensions),
            playwright_clients: self.playwright_clients.clone(),
            seq_counter: self.seq_counter,
        }
    }

    fn with_clients(
        &self,
        f: impl FnOnce(&mut HashMap<ClientId, Arc<PlaywrightClient>>),
    ) -> RelayState {
        let mut clients = (*self.playwright_clients).clone();
        f(&mut clients);
        RelayState {
            extensions: self.extensions.clone(),
            playwright_clients: Arc::new(clients),
            seq_counter: self.seq_counter,
        }
    }

    /// Apply `f` to a single extension entry if it exists, producing a new
    /// state with only that entry's `Arc` replaced. A no-op (shares the
    /// prior `Arc` reference) if the extension doesn't exist or `f` leaves
    /// the entry unchanged.
    fn update_extension(
        &self,
        extension_id: &str,
        f: impl FnOnce(&ExtensionEntry) -> ExtensionEntry,
    ) -> RelayState {
        match self.extensions.get(extension_id) {
            None => self.clone(),
            Some(entry) => {
                let updated = Arc::new(f(entry));
                self.with_extensions(|map| {
                    map.insert(extension_id.to_string(), updated);
                })
            }
        }
    }

    // ---- extension lifecycle -------------------------------------------------

    /// `addExtension`: register a new extension connection, assigning it
    /// the next sequence number so reconnect overlap resolves to "newest".
    pub fn add_extension(&self, id: ExtensionId, info: ExtensionInfo) -> RelayState {
        let seq = self.seq_counter + 1;
        let entry = ExtensionEntry::new(id.clone(), info, seq);
        let next = self.with_extensions(|map| {
            map.insert(id, Arc::new(entry));
        });
        RelayState {
            seq_counter: seq,
            ..next
        }
    }

    /// `removeExtension`
    pub fn remove_extension(&self, id: &str) -> RelayState {
        if !self.extensions.contains_key(id) {
            return self.clone();
        }
        self.with_extensions(|map| {
            map.remove(id);
        })
    }

    /// `rebindClientsToExtension(from, to)`: atomically re-point every
    /// client bound to `from` onto `to` in a single transition, so a
    /// driver never observes a window where its binding resolves to
    /// nothing (spec §5 replacement semantics, property 7).
    pub fn rebind_clients_to_extension(&self, from: &str, to: &str) -> RelayState {
        let affected: Vec<ClientId> = self
            .playwright_clients
            .iter()
            .filter(|(_, c)| c.extension_id.as_deref() == Some(from))
            .map(|(id, _)| id.clone())
            .collect();
        if affected.is_empty() {
            return self.clone();
        }
        self.with_clients(|map| {
            for id in affected {
                map.insert(
                    id.clone(),
                    Arc::new(PlaywrightClient {
                        id,
                        extension_id: Some(to.to_string()),
                    }),
                );
            }
        })
    }

    /// `updateExtensionIO`: flip the liveness flag on the side-table handle.
    pub fn update_extension_io(&self, id: &str, io_live: bool) -> RelayState {
        self.update_extension(id, |entry| ExtensionEntry {
            io_live,
            ..entry.clone()
        })
    }

    /// `incrementExtensionMessageId`: atomically allocate the next outbound
    /// message id for `id`, returning the updated state and the new id.
    pub fn increment_extension_message_id(&self, id: &str) -> (RelayState, Option<MessageId>) {
        match self.extensions.get(id) {
            None => (self.clone(), None),
            Some(entry) => {
                let next_id = entry.message_id + 1;
                let state = self.update_extension(id, |entry| ExtensionEntry {
                    message_id: next_id,
                    ..entry.clone()
                });
                (state, Some(next_id))
            }
        }
    }

    /// `addExtensionPendingRequest`
    pub fn add_extension_pending_request(&self, id: &str, message_id: MessageId) -> RelayState {
        self.update_extension(id, |entry| {
            let mut entry = entry.clone();
            entry.pending_requests.insert(message_id);
            entry
        })
    }

    /// `removeExtensionPendingRequest`
    pub fn remove_extension_pending_request(&self, id: &str, message_id: MessageId) -> RelayState {
        self.update_extension(id, |entry| {
            let mut entry = entry.clone();
            entry.pending_requests.remove(&message_id);
            entry
        })
    }

    /// `clearExtensionPendingRequests`: returns the ids that were pending so
    /// the caller can reject their side-table callbacks with
    /// "Extension connection closed".
    pub fn clear_extension_pending_requests(&self, id: &str) -> (RelayState, Vec<MessageId>) {
        match self.extensions.get(id) {
            None => (self.clone(), Vec::new()),
            Some(entry) => {
                let cleared: Vec<MessageId> = entry.pending_requests.iter().copied().collect();
                if cleared.is_empty() {
                    return (self.clone(), cleared);
                }
                let state = self.update_extension(id, |entry| ExtensionEntry {
                    pending_requests: Default::default(),
                    ..entry.clone()
                });
                (state, cleared)
            }
        }
    }

    // ---- playwright clients ---------------------------------------------------

    /// `addPlaywrightClient`
    pub fn add_playwright_client(&self, id: ClientId, extension_id: Option<ExtensionId>) -> RelayState {
        self.with_clients(|map| {
            map.insert(id.clone(), Arc::new(PlaywrightClient { id, extension_id }));
        })
    }

    /// `removePlaywrightClient`
    pub fn remove_playwright_client(&self, id: &str) -> RelayState {
        if !self.playwright_clients.contains_key(id) {
            return self.clone();
        }
        self.with_clients(|map| {
            map.remove(id);
        })
    }

    /// `removeClientsForExtension`: returns the removed client ids so the
    /// caller can close their sockets.
    pub fn remove_clients_for_extension(&self, extension_id: &str) -> (RelayState, Vec<ClientId>) {
        let affected: Vec<ClientId> = self
            .playwright_clients
            .iter()
            .filter(|(_, c)| c.extension_id.as_deref() == Some(extension_id))
            .map(|(id, _)| id.clone())
            .collect();
        if affected.is_empty() {
            return (self.clone(), affected);
        }
        let next = self.with_clients(|map| {
            for id in &affected {
                map.remove(id);
            }
        });
        (next, affected)
    }

    // ---- targets ---------------------------------------------------------------

    /// `addTarget`: insert or update a `ConnectedTarget`, preserving the
    /// previous `frame_ids` set when the session already existed.
    pub fn add_target(
        &self,
        extension_id: &str,
        session_id: SessionId,
        target_info: TargetInfo,
    ) -> RelayState {
        self.update_extension(extension_id, |entry| {
            let mut entry = entry.clone();
            let frame_ids = entry
                .connected_targets
                .get(&session_id)
                .map(|t| t.frame_ids.clone())
                .unwrap_or_default();
            let target_id = target_info.target_id.clone();
            entry.connected_targets.insert(
                session_id.clone(),
                ConnectedTarget {
                    session_id,
                    target_id,
                    target_info,
                    frame_ids,
                },
            );
            entry
        })
    }

    /// `removeTarget`: drop by `sessionId` (spec `Target.detachedFromTarget`).
    pub fn remove_target(&self, extension_id: &str, session_id: &str) -> RelayState {
        self.update_extension(extension_id, |entry| {
            let mut entry = entry.clone();
            entry.connected_targets.remove(session_id);
            entry
        })
    }

    /// `removeTargetByCrash`: drop by `targetId` (spec `Target.targetCrashed`).
    pub fn remove_target_by_crash(&self, extension_id: &str, target_id: &str) -> RelayState {
        self.update_extension(extension_id, |entry| {
            let mut entry = entry.clone();
            entry
                .connected_targets
                .retain(|_, t| t.target_id != target_id);
            entry
        })
    }

    /// `updateTargetInfo`
    pub fn update_target_info(
        &self,
        extension_id: &str,
        session_id: &str,
        target_info: TargetInfo,
    ) -> RelayState {
        self.update_extension(extension_id, |entry| {
            let mut entry = entry.clone();
            if let Some(target) = entry.connected_targets.get_mut(session_id) {
                target.target_info = target_info;
            }
            entry
        })
    }

    /// `addFrameId`
    pub fn add_frame_id(&self, extension_id: &str, session_id: &str, frame_id: FrameId) -> RelayState {
        self.update_extension(extension_id, |entry| {
            let mut entry = entry.clone();
            if let Some(target) = entry.connected_targets.get_mut(session_id) {
                target.frame_ids.insert(frame_id);
            }
            entry
        })
    }

    /// `removeFrameId`: remove from whichever target currently owns it,
    /// matching spec's "Remove frameId from its owner".
    pub fn remove_frame_id(&self, extension_id: &str, frame_id: &str) -> RelayState {
        self.update_extension(extension_id, |entry| {
            let mut entry = entry.clone();
            for target in entry.connected_targets.values_mut() {
                target.frame_ids.remove(frame_id);
            }
            entry
        })
    }

    /// `updateTargetUrl`
    pub fn update_target_url(
        &self,
        extension_id: &str,
        session_id: &str,
        url: String,
        title: Option<String>,
    ) -> RelayState {
        self.update_extension(extension_id, |entry| {
            let mut entry = entry.clone();
            if let Some(target) = entry.connected_targets.get_mut(session_id) {
                target.target_info.url = url.clone();
                if let Some(title) = &title {
                    target.target_info.title = title.clone();
                }
            }
            entry
        })
    }

    /// Resolve the target id that owns a given CDP session id for a
    /// specific extension (used by the crash/detach transitions above and
    /// by the lookup module).
    pub fn target_id_for_session(&self, extension_id: &str, session_id: &str) -> Option<TargetId> {
        self.extensions
            .get(extension_id)?
            .connected_targets
            .get(session_id)
            .map(|t| t.target_id.clone())
    }
}

/// Listener signature: called synchronously after every `set_state`, with
/// `(next, previous)`.
type Listener = Box<dyn Fn(&RelayState, &RelayState) + Send + Sync>;

/// Single source of truth for the relay (spec §4.A `getState`/`setState`/`subscribe`).
pub struct Store {
    state: RwLock<RelayState>,
    listeners: RwLock<Vec<Listener>>,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RelayState::new()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Snapshot the current state. Cheap: the snapshot shares `Arc`
    /// references with whatever's live, it doesn't deep-clone entries.
    pub fn get_state(&self) -> RelayState {
        self.state.read().expect("relay state lock poisoned").clone()
    }

    /// Apply a pure transition. `f` receives the current state and returns
    /// the next one; subscribers then run synchronously with
    /// `(next, previous)` before this call returns.
    pub fn set_state(&self, f: impl FnOnce(&RelayState) -> RelayState) -> RelayState {
        let (prev, next) = {
            let mut guard = self.state.write().expect("relay state lock poisoned");
            let prev = guard.clone();
            let next = f(&prev);
            *guard = next.clone();
            (prev, next)
        };
        let listeners = self.listeners.read().expect("relay listeners lock poisoned");
        for listener in listeners.iter() {
            listener(&next, &prev);
        }
        next
    }

    /// Register a reactive side-effect, fired synchronously after every
    /// `set_state` with `(next, previous)`.
    pub fn subscribe(&self, listener: impl Fn(&RelayState, &RelayState) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("relay listeners lock poisoned")
            .push(Box::new(listener));
    }
}

impl Default for Store {
    fn default() -> Self {
        Self {
            state: RwLock::new(RelayState::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ExtensionInfo {
        ExtensionInfo {
            profile_id: Some("p1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn add_then_remove_extension_is_idempotent() {
        let start = RelayState::new();
        let added = start.add_extension("e1".into(), info());
        assert_eq!(added.extensions.len(), 1);
        let removed = added.remove_extension("e1");
        // seq_counter differs (monotonic), but the map contents round-trip.
        assert_eq!(removed.extensions.len(), start.extensions.len());
        assert!(removed.extensions.is_empty());
    }

    #[test]
    fn unrelated_submap_is_reference_shared_across_transitions() {
        let start = RelayState::new()
            .add_extension("e1".into(), info())
            .add_playwright_client("c1".into(), Some("e1".into()));
        let next = start.add_extension("e2".into(), ExtensionInfo::default());
        // Touching extensions must not reallocate playwright_clients.
        assert!(Arc::ptr_eq(&start.playwright_clients, &next.playwright_clients));
        assert!(!Arc::ptr_eq(&start.extensions, &next.extensions));
    }

    #[test]
    fn add_target_preserves_existing_frame_ids() {
        let state = RelayState::new().add_extension("e1".into(), info());
        let state = state.add_target(
            "e1",
            "pw-tab-1".into(),
            TargetInfo {
                target_id: "T1".into(),
                r#type: "page".into(),
                url: "https://a".into(),
                ..Default::default()
            },
        );
        let state = state.add_frame_id("e1", "pw-tab-1", "F1".into());
        let state = state.add_target(
            "e1",
            "pw-tab-1".into(),
            TargetInfo {
                target_id: "T1".into(),
                r#type: "page".into(),
                url: "https://a/2".into(),
                ..Default::default()
            },
        );
        let target = &state.extensions["e1"].connected_targets["pw-tab-1"];
        assert!(target.frame_ids.contains("F1"));
        assert_eq!(target.target_info.url, "https://a/2");
    }

    #[test]
    fn repeated_target_info_changed_is_a_fixed_point() {
        let state = RelayState::new().add_extension("e1".into(), info());
        let state = state.add_target(
            "e1",
            "pw-tab-1".into(),
            TargetInfo {
                target_id: "T1".into(),
                ..Default::default()
            },
        );
        let info1 = TargetInfo {
            target_id: "T1".into(),
            url: "https://a".into(),
            ..Default::default()
        };
        let once = state.update_target_info("e1", "pw-tab-1", info1.clone());
        let twice = once.update_target_info("e1", "pw-tab-1", info1);
        assert_eq!(once, twice);
    }

    #[test]
    fn rebind_clients_to_extension_moves_bindings_atomically() {
        let state = RelayState::new()
            .add_extension("e1".into(), info())
            .add_extension("e2".into(), ExtensionInfo::default())
            .add_playwright_client("c1".into(), Some("e1".into()))
            .add_playwright_client("c2".into(), Some("e1".into()));
        let state = state.rebind_clients_to_extension("e1", "e2");
        assert_eq!(
            state.playwright_clients["c1"].extension_id.as_deref(),
            Some("e2")
        );
        assert_eq!(
            state.playwright_clients["c2"].extension_id.as_deref(),
            Some("e2")
        );
    }

    #[test]
    fn remove_clients_for_extension_reports_removed_ids() {
        let state = RelayState::new()
            .add_extension("e1".into(), info())
            .add_playwright_client("c1".into(), Some("e1".into()))
            .add_playwright_client("c2".into(), None);
        let (next, removed) = state.remove_clients_for_extension("e1");
        assert_eq!(removed, vec!["c1".to_string()]);
        assert!(!next.playwright_clients.contains_key("c1"));
        assert!(next.playwright_clients.contains_key("c2"));
    }

    #[test]
    fn store_runs_subscribers_synchronously_with_next_and_previous() {
        let store = Store::new();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen_clone = seen.clone();
        store.subscribe(move |next, prev| {
            seen_clone
                .write()
                .unwrap()
                .push((next.extensions.len(), prev.extensions.len()));
        });
        store.set_state(|s| s.add_extension("e1".into(), ExtensionInfo::default()));
        assert_eq!(*seen.read().unwrap(), vec![(1, 0)]);
    }
}

//! Data model for the relay state atom (spec §3).
//!
//! Every entity here is plain data: no I/O handles, no timers, no channel
//! senders. Live sockets, keep-alive timers and pending-request resolvers
//! live in per-connection side tables owned by `session::extension` and
//! `session::driver` — the store only ever needs to know *that* a
//! connection exists and *whether* its I/O is still live, not the handle
//! itself. That split is what keeps `setState`'s transition functions pure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type ExtensionId = String;
pub type ClientId = String;
pub type SessionId = String;
pub type TargetId = String;
pub type FrameId = String;
pub type MessageId = u64;

/// CDP `Target.TargetInfo`, trimmed to the fields the relay actually reads
/// or rewrites (spec §4.E/§4.F).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetInfo {
    pub target_id: TargetId,
    pub r#type: String,
    pub title: String,
    pub url: String,
    pub attached: bool,
    pub waiting_for_debugger: bool,
    pub parent_frame_id: Option<FrameId>,
}

/// One attached tab or OOPIF session (spec §3 `ConnectedTarget`).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedTarget {
    pub session_id: SessionId,
    pub target_id: TargetId,
    pub target_info: TargetInfo,
    /// Frame ids currently associated with this session. Disjoint from
    /// every other target's `frame_ids` within the same extension
    /// (invariant 5).
    pub frame_ids: HashSet<FrameId>,
}

impl ConnectedTarget {
    pub fn new(session_id: SessionId, target_id: TargetId, target_info: TargetInfo) -> Self {
        Self {
            session_id,
            target_id,
            target_info,
            frame_ids: HashSet::new(),
        }
    }
}

/// Free-form metadata an extension supplies at connect time, used to derive
/// its `stable_key` (spec §3).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtensionInfo {
    pub browser: Option<String>,
    pub email: Option<String>,
    pub profile_id: Option<String>,
    pub version: Option<String>,
}

impl ExtensionInfo {
    /// Derive the priority-ordered stable key (spec §3): `profile:<id>`,
    /// else `email:<email>`, else `browser:<browser>`, else the connection
    /// id passed in as the final fallback.
    pub fn stable_key(&self, connection_id: &str) -> String {
        if let Some(profile) = &self.profile_id {
            format!("profile:{profile}")
        } else if let Some(email) = &self.email {
            format!("email:{email}")
        } else if let Some(browser) = &self.browser {
            format!("browser:{browser}")
        } else {
            format!("connection:{connection_id}")
        }
    }
}

/// One live extension WebSocket (spec §3 `ExtensionEntry`).
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionEntry {
    pub id: ExtensionId,
    pub stable_key: String,
    pub info: ExtensionInfo,
    pub connected_targets: HashMap<SessionId, ConnectedTarget>,
    /// Outbound message ids for which a response is still outstanding.
    /// The resolve/reject pair itself lives in the extension session's I/O
    /// side table, keyed by the same id.
    pub pending_requests: HashSet<MessageId>,
    /// Monotonic counter for outbound extension-directed messages.
    pub message_id: MessageId,
    /// Whether the socket side table still has a live handle for this
    /// entry. Cleared just before `removeExtension` fires during teardown,
    /// so lookups can distinguish a lingering entry from a routable one.
    pub io_live: bool,
    /// Insertion order marker, used to resolve "newest wins" for
    /// `stable_key` collisions during reconnect overlap (invariant 3).
    pub seq: u64,
}

impl ExtensionEntry {
    pub fn new(id: ExtensionId, info: ExtensionInfo, seq: u64) -> Self {
        let stable_key = info.stable_key(&id);
        Self {
            id,
            stable_key,
            info,
            connected_targets: HashMap::new(),
            pending_requests: HashSet::new(),
            message_id: 0,
            io_live: true,
            seq,
        }
    }
}

/// One connected driver WebSocket (spec §3 `PlaywrightClient`).
#[derive(Debug, Clone, PartialEq)]
pub struct PlaywrightClient {
    pub id: ClientId,
    /// Non-null once bound; `None` only transiently, pre-bind (invariant 1).
    pub extension_id: Option<ExtensionId>,
}

/// The relay state atom (spec §3 `RelayState`).
///
/// The two top-level maps are `Arc`-wrapped so that a transition touching
/// only one of them leaves the other's `Arc` pointer untouched — cheap,
/// reference-equal sharing across `setState` calls (testable property 1).
/// Map values are themselves `Arc`-wrapped so that updating one entry
/// doesn't require cloning every sibling entry's data, only its pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayState {
    pub extensions: Arc<HashMap<ExtensionId, Arc<ExtensionEntry>>>,
    pub playwright_clients: Arc<HashMap<ClientId, Arc<PlaywrightClient>>>,
    /// Monotonic counter backing `ExtensionEntry::seq`.
    pub seq_counter: u64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            extensions: Arc::new(HashMap::new()),
            playwright_clients: Arc::new(HashMap::new()),
            seq_counter: 0,
        }
    }
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }
}

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique connection id (monotonic + random, spec §3
/// `ExtensionEntry.id`): a per-process counter paired with a random
/// suffix so ids are both ordered and unguessable.
pub fn new_connection_id() -> String {
    let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{n}-{}", uuid::Uuid::new_v4())
}

//! The centralized relay state store (spec §4.A) and its read-only
//! routing helpers (spec §4.B).

pub mod lookup;
pub mod model;
pub mod store;

pub use model::{
    new_connection_id, ClientId, ConnectedTarget, ExtensionEntry, ExtensionId, ExtensionInfo, FrameId,
    MessageId, PlaywrightClient, RelayState, SessionId, TargetId, TargetInfo,
};
pub use store::Store;

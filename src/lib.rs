//! CDP Relay Core: a protocol-translation relay that lets a CDP driver
//! (e.g. a Playwright client) control browser tabs through an extension
//! rather than through a dedicated automation-launched browser.

pub mod config;
pub mod error;

pub mod cdp;
pub mod events;
pub mod relay;
pub mod server;
pub mod session;
pub mod state;

// Re-exports
pub use error::{Error, Result};
pub use relay::Relay;

/// CDP Relay Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

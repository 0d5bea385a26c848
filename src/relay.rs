//! Composition root: the shared context every session, emulator and
//! translator call threads through.

use crate::config::Config;
use crate::events::EventBus;
use crate::session::driver::DriverRegistry;
use crate::session::extension::ExtensionIoTable;
use crate::state::Store;
use std::sync::Arc;

/// Everything a connection handler needs: the state store, the event bus,
/// the process configuration, and the two I/O side tables (spec §3 design
/// note — sockets and timers live outside the pure `RelayState`).
pub struct Relay {
    pub store: Arc<Store>,
    pub events: EventBus,
    pub config: Config,
    pub extension_io: ExtensionIoTable,
    pub drivers: DriverRegistry,
}

impl Relay {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            store: Store::new(),
            events: EventBus::default(),
            config,
            extension_io: ExtensionIoTable::default(),
            drivers: DriverRegistry::default(),
        })
    }
}

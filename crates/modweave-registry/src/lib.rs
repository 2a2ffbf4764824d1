//! Authoritative mod registry of the controller context.
//!
//! Owns the installed-mod set and its whole lifecycle: install (validate
//! in a disposable realm, trusted-recompile, resolve requirements),
//! cascading uninstall, per-origin enablement, background event
//! dispatch, tab lifecycle, and coalesced persistence through the host's
//! key-value store.

mod error;
mod handlers;
mod registry;
mod sort;
mod store;
mod tabs;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use handlers::register_controller_handlers;
pub use registry::{InjectorEvent, InstalledMod, ModRegistry, ModStatus};
pub use sort::sort_mods;
pub use store::{KvStore, MOD_KEY, MemoryKv, ModSaver, ORIGIN_KEY, ORIGIN_SETTINGS_KEY, StoredMod};
pub use tabs::{NullTabBridge, TabBridge, TabInfo};

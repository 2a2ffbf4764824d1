//! Running-mod loader of the page-injected agent context.
//!
//! The controller decides *what* runs where; this loader owns *running
//! it*: queued load/extract actions, per-context trusted compilation,
//! dependency method binding from already-loaded providers, capability
//! handles, and ordered teardown when the context goes away.

mod error;
mod host;
mod loader;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use host::{DialogHost, GuiHandle, LoaderHost, NullGui, NullToaster, SilentDialogs, ToastKind, Toaster};
pub use loader::{LoaderSettings, ModBundle, ModLoader};

//! Sandboxed execution of untrusted mod bundles.
//!
//! Candidates run first in a disposable validation realm with a denying
//! network surface and a resource ledger recording every registration;
//! the realm is destroyed — timers cancelled, listeners removed, pending
//! fetches rejected — before anything about the mod is believed. Accepted
//! sources are then re-instantiated by the [`TrustedCompiler`] against
//! the hosting context's real capability surface with storage bound.

mod compile;
mod error;
mod realm;
mod resources;
mod source;
mod validate;

#[cfg(test)]
mod tests;

pub use compile::{CompiledMod, DependencyBinding, ProviderHandle, TrustedCompiler};
pub use error::{Error, Result};
pub use resources::{ResourceSnapshot, TeardownReport};
pub use source::decompress;
pub use validate::Validator;

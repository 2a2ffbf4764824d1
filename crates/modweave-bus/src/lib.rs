//! Cross-context transport.
//!
//! The three execution contexts (privileged controller, page relay,
//! page-injected agent) share nothing but a broadcast bus of encoded
//! buffers. Each context owns an [`EventHandler`] bound to its role's
//! correlation-id range, a signature derived from the role name, and the
//! session payload codec. Requests and replies correlate by id; nothing
//! on the bus is addressed, so every participant decodes everything and
//! drops what is not for it.

mod error;
mod handler;
mod role;

pub use error::Error;
pub use handler::{BusSender, EventHandler, HandshakeSettings, broadcast_bus};
pub use role::ContextRole;

pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

/// Default settlement timeout for correlated requests. User-gesture
/// driven calls pass `None` instead and wait indefinitely.
pub const DEFAULT_PROMISE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a handshake initiator keeps pinging before giving up.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Cadence of handshake pings.
pub const HANDSHAKE_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Envelope kind reserved for the init handshake.
pub const INIT_EVENT: &str = "init-event";

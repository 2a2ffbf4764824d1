use modweave_protocol::{DecodeError, WireError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The correlated request was not settled before its deadline. The
    /// id has been returned to the pool; a late reply is dropped.
    #[error("request `{kind}` timed out")]
    Timeout { kind: String },
    /// Every id in this role's band is outstanding.
    #[error("correlation ids exhausted")]
    IdsExhausted,
    /// The bus or the local dispatch loop is gone.
    #[error("bus closed")]
    BusClosed,
    /// The responder rejected; rehydrated from the wire at this boundary.
    #[error("{}", .0.message)]
    Remote(WireError),
    #[error("handshake failed: no pong within the deadline")]
    HandshakeFailed,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Error {
    pub fn timeout(kind: impl Into<String>) -> Self {
        Self::Timeout { kind: kind.into() }
    }

    /// Stack carried by a remote rejection, when there is one.
    pub fn remote_stack(&self) -> Option<&str> {
        match self {
            Self::Remote(wire) => Some(wire.stack.as_str()),
            _ => None,
        }
    }
}

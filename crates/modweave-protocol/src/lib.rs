//! Wire layer shared by all three execution contexts.
//!
//! Everything that crosses the broadcast bus is an [`Envelope`] serialized
//! to JSON, shifted through the [`PayloadCodec`], and dispatched as a
//! buffer of code points. Contexts share no memory; the envelope plus its
//! sender signature is the whole contract.

mod codec;
mod envelope;
mod id;

pub use codec::{DecodeError, PayloadCodec};
pub use envelope::{Envelope, PromiseBody, PromisePayload, PromiseStatus, WireError};
pub use id::{IdAllocator, IdRange};

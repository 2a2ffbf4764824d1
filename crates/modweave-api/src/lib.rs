//! Stable contract between the modweave runtime and mod authors.
//!
//! A mod bundle is a WebAssembly module exposing the exports described in
//! [`abi`]; its declared metadata is a JSON document served from guest
//! memory and parsed into a [`ModMetadata`], which the runtime promotes to
//! a validated [`ModDescriptor`].

pub mod abi;
mod descriptor;
mod events;
mod hash;
mod origins;
mod storage;

pub use descriptor::{
    MetadataError, ModDescriptor, ModFlag, ModMetadata, ModRequirement, parse_requirement,
};
pub use events::{BackgroundContext, BackgroundEvent, TabContext};
pub use hash::content_hash;
pub use origins::OriginPattern;
pub use storage::{ModStorage, ModStorageData, StorageScope};

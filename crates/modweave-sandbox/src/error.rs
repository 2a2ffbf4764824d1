use semver::Version;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The payload could not be decompressed or decoded into a module.
    #[error("decode failed: {reason}")]
    Decode { reason: String },
    /// The source is not a usable mod bundle (does not compile, misses
    /// the metadata exports, or violates the ABI).
    #[error("invalid mod: {reason}")]
    InvalidMod { reason: String },
    /// The declared metadata is malformed.
    #[error("validation failed: {reason}")]
    Validation { reason: String },
    /// A capability-gated host call was made without the capability.
    #[error("permission denied: `{capability}` requires the matching capability flag")]
    Permission { capability: String },
    #[error("missing dependency `{dependency}-{min_version}`+")]
    MissingDependency {
        dependency: String,
        min_version: Version,
    },
    #[error(
        "dependency `{dependency}` version mismatch: required {required}, installed {installed}"
    )]
    VersionMismatch {
        dependency: String,
        required: Version,
        installed: Version,
    },
    /// The realm was torn down; whatever was pending is gone.
    #[error("realm destroyed")]
    Destroyed,
    #[error(transparent)]
    Wasm(#[from] wasmtime::Error),
}

impl Error {
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    pub fn invalid_mod(reason: impl Into<String>) -> Self {
        Self::InvalidMod {
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn permission(capability: impl Into<String>) -> Self {
        Self::Permission {
            capability: capability.into(),
        }
    }

    pub fn missing_dependency(dependency: impl Into<String>, min_version: Version) -> Self {
        Self::MissingDependency {
            dependency: dependency.into(),
            min_version,
        }
    }
}

/// Recovers a host-raised [`Error`] from a trapped guest call, keeping
/// anything else as a wasm error.
pub(crate) fn map_wasm_error(error: wasmtime::Error) -> Error {
    match error.downcast::<Error>() {
        Ok(ours) => ours,
        Err(other) => Error::Wasm(other),
    }
}

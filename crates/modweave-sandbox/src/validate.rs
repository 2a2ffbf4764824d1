use modweave_api::{ModDescriptor, ModFlag, ModMetadata, content_hash};
use tracing::debug;
use wasmtime::Engine;

use crate::error::{Error, Result};
use crate::realm::{Realm, RealmState};

/// Runs untrusted mod bundles in disposable realms and extracts their
/// validated descriptors. The realm never outlives the call.
pub struct Validator {
    engine: Engine,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
        }
    }

    /// Validates decompressed source. Whatever happens, the realm is
    /// destroyed before returning; nothing the candidate registered
    /// survives.
    pub fn validate(&self, source: &[u8]) -> Result<ModDescriptor> {
        let hash = content_hash(source);
        let mut realm = Realm::run(&self.engine, source, RealmState::validation())?;
        let result = extract_descriptor(&mut realm, hash);
        let report = realm.destroy();
        debug!(
            target: "modweave_sandbox::validate",
            hash,
            ok = result.is_ok(),
            cancelled_timeouts = report.cancelled_timeouts,
            removed_listeners = report.removed_listeners,
            "validation realm reclaimed"
        );
        result
    }
}

fn extract_descriptor(realm: &mut Realm, hash: i32) -> Result<ModDescriptor> {
    let json = realm.metadata_json()?;
    let meta: ModMetadata = serde_json::from_str(&json)
        .map_err(|error| Error::validation(format!("metadata does not parse: {error}")))?;
    let flags = meta.flags.clone();
    let descriptor = ModDescriptor::from_metadata(meta, hash)
        .map_err(|error| Error::validation(error.to_string()))?;
    // From here the candidate holds its declared capabilities, the same
    // way the trusted compile will grant them.
    realm.grant_capabilities(&flags);

    if descriptor.has_flag(ModFlag::BackgroundScript) && !realm.has_background() {
        return Err(Error::invalid_mod(
            "background-script flag declared without a background export",
        ));
    }
    Ok(descriptor)
}

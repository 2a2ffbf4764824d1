use modweave_api::{BackgroundEvent, ModDescriptor, ModStorage};
use semver::Version;
use serde_json::Value;
use tracing::debug;
use wasmtime::Engine;

use crate::error::{Error, Result};
use crate::realm::{Realm, RealmState};
use crate::resources::ResourceSnapshot;

/// An installed mod that can satisfy requirements of others.
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    pub dependency_name: String,
    pub version: Version,
    pub methods: Value,
}

/// A requirement resolved against a concrete provider.
#[derive(Debug, Clone)]
pub struct DependencyBinding {
    pub name: String,
    pub version: Version,
    pub methods: Value,
}

/// A validated mod re-instantiated against the hosting context's real
/// capability surface, with storage bound and requirements resolved.
pub struct CompiledMod {
    pub descriptor: ModDescriptor,
    pub storage: ModStorage,
    pub dependencies: Vec<DependencyBinding>,
    realm: Realm,
}

impl CompiledMod {
    pub fn on_load(&mut self) -> Result<()> {
        self.realm.call_on_load()
    }

    pub fn on_unload(&mut self) -> Result<()> {
        self.realm.call_on_unload()
    }

    /// Delivers a background event and returns the guest's replacement
    /// `global`, when it produced one.
    pub fn background(&mut self, event: &BackgroundEvent) -> Result<Option<Value>> {
        let json = serde_json::to_string(event)
            .map_err(|error| Error::validation(format!("unserializable event: {error}")))?;
        match self.realm.call_background(&json)? {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|error| Error::validation(format!("background response: {error}"))),
        }
    }

    /// Methods this mod offers to dependents.
    pub fn export_methods(&mut self) -> Result<Value> {
        Ok(self.realm.export_methods()?.unwrap_or(Value::Null))
    }

    pub fn resource_snapshot(&self) -> ResourceSnapshot {
        self.realm.resource_snapshot()
    }

    /// Intentionally a no-op: running-instance lifetime is the caller's
    /// responsibility. Realm resources are reclaimed when the compiled
    /// mod is dropped.
    pub fn destroy(&self) {}
}

impl std::fmt::Debug for CompiledMod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledMod")
            .field("descriptor", &self.descriptor)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Re-executes already-validated source against the real capability
/// surface of the hosting context.
pub struct TrustedCompiler {
    engine: Engine,
}

impl Default for TrustedCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustedCompiler {
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
        }
    }

    /// Compiles `source` for one context. `context_key` scopes the local
    /// storage tier; `providers` are the currently installed mods that
    /// expose a dependency name.
    ///
    /// An unmet requirement destroys the freshly compiled realm and
    /// fails without side effects — the mod is never registered.
    pub fn compile(
        &self,
        source: &[u8],
        descriptor: ModDescriptor,
        storage: ModStorage,
        context_key: &str,
        providers: &[ProviderHandle],
    ) -> Result<CompiledMod> {
        let state = RealmState::trusted(&descriptor.flags, storage.clone(), context_key, &descriptor.name);
        let mut realm = Realm::run(&self.engine, source, state)?;

        let mut dependencies = Vec::with_capacity(descriptor.requirements.len());
        for requirement in &descriptor.requirements {
            let provider = providers
                .iter()
                .find(|p| p.dependency_name == requirement.dependency_name);
            match provider {
                None => {
                    realm.destroy();
                    return Err(Error::missing_dependency(
                        requirement.dependency_name.clone(),
                        requirement.min_version.clone(),
                    ));
                }
                Some(provider) if provider.version < requirement.min_version => {
                    realm.destroy();
                    return Err(Error::VersionMismatch {
                        dependency: requirement.dependency_name.clone(),
                        required: requirement.min_version.clone(),
                        installed: provider.version.clone(),
                    });
                }
                Some(provider) => dependencies.push(DependencyBinding {
                    name: requirement.dependency_name.clone(),
                    version: provider.version.clone(),
                    methods: provider.methods.clone(),
                }),
            }
        }

        debug!(
            target: "modweave_sandbox::compile",
            mod_name = %descriptor.name,
            hash = descriptor.hash,
            dependencies = dependencies.len(),
            "trusted compile complete"
        );
        Ok(CompiledMod {
            descriptor,
            storage,
            dependencies,
            realm,
        })
    }
}

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use semver::Version;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use modweave_api::{
    BackgroundContext, BackgroundEvent, ModDescriptor, ModFlag, ModStorage, TabContext,
};
use modweave_sandbox::{CompiledMod, ProviderHandle, TrustedCompiler, Validator, decompress};

use crate::error::{Error, Result};
use crate::sort::sort_mods;
use crate::store::{KvStore, ModSaver, ORIGIN_KEY, ORIGIN_SETTINGS_KEY, StoredMod};
use crate::tabs::TabBridge;

/// Rolling per-mod error log size; oldest entries drop beyond it.
const ERROR_LOG_CAP: usize = 10;
/// Storage context key of the controller context.
const CONTROLLER_CONTEXT: &str = "controller";

/// One mod the registry owns: its trusted compile, raw payload, storage,
/// enablement, and background bookkeeping.
pub struct InstalledMod {
    compiled: CompiledMod,
    payload: Vec<u8>,
    storage: ModStorage,
    enabled_on_origins: Vec<String>,
    errors: VecDeque<String>,
    global: Value,
    tab_data: HashMap<u64, Value>,
}

impl InstalledMod {
    pub fn descriptor(&self) -> &ModDescriptor {
        &self.compiled.descriptor
    }

    pub fn enabled_on_origins(&self) -> &[String] {
        &self.enabled_on_origins
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.iter().cloned().collect()
    }

    pub fn global(&self) -> &Value {
        &self.global
    }

    fn record_error(&mut self, message: String) {
        warn!(
            target: "modweave_registry::mods",
            mod_name = %self.compiled.descriptor.name,
            "lifecycle callback failed: {message}"
        );
        if self.errors.len() >= ERROR_LOG_CAP {
            self.errors.pop_front();
        }
        self.errors.push_back(message);
    }
}

/// Per-origin status of one installed mod.
#[derive(Debug, Clone, Serialize)]
pub struct ModStatus {
    pub enabled: bool,
    /// Descriptive reason the mod cannot run, when a requirement is
    /// unmet.
    pub dependency_error: Option<String>,
    /// Advisory: names of installed mods whose satisfied requirement
    /// points at this one.
    pub required_by: Vec<String>,
}

/// Injector-side lifecycle notification forwarded to the owning mod.
#[derive(Debug, Clone)]
pub enum InjectorEvent {
    Load,
    Unload,
    Message(Value),
}

enum EventKind {
    Install,
    Uninstall,
    Load,
    Unload,
    Enabled(String),
    Disable(String),
}

/// The authoritative mod registry of the controller context.
///
/// Owns install/uninstall, per-origin enablement, dependency resolution,
/// background lifecycle dispatch, and persistence. Multi-step sequences
/// (cascading uninstall) fully await each step; the save queue is the
/// one serialization point.
pub struct ModRegistry<K: KvStore, T: TabBridge> {
    saver: ModSaver<K>,
    tabs: T,
    validator: Validator,
    compiler: TrustedCompiler,
    mods: Vec<InstalledMod>,
    enabled_origins: Vec<String>,
    origin_settings: HashMap<String, Value>,
    open_tabs: HashMap<u64, String>,
}

impl<K: KvStore + 'static, T: TabBridge> ModRegistry<K, T> {
    pub fn new(kv: Arc<K>, tabs: T) -> Self {
        Self {
            saver: ModSaver::new(kv),
            tabs,
            validator: Validator::new(),
            compiler: TrustedCompiler::new(),
            mods: Vec::new(),
            enabled_origins: Vec::new(),
            origin_settings: HashMap::new(),
            open_tabs: HashMap::new(),
        }
    }

    /// Loads persisted state and brings every stored mod back up in
    /// priority/dependency order. A mod that fails to restore is logged
    /// and skipped; the rest still come up.
    pub async fn init(&mut self) {
        let mut stored = self.saver.load().await;
        sort_mods(&mut stored, |record| {
            (
                record.descriptor.priority,
                record.descriptor.requirements.len(),
            )
        });
        for record in stored {
            let name = record.descriptor.name.clone();
            if let Err(err) = self.restore(record).await {
                error!(target: "modweave_registry::init", mod_name = %name, "unable to restore mod: {err}");
            }
        }

        if let Ok(Some(raw)) = self.saver.store().get(ORIGIN_KEY).await {
            if let Ok(origins) = serde_json::from_value(raw) {
                self.enabled_origins = origins;
            }
        }
        if let Ok(Some(raw)) = self.saver.store().get(ORIGIN_SETTINGS_KEY).await {
            if let Ok(settings) = serde_json::from_value(raw) {
                self.origin_settings = settings;
            }
        }
        info!(
            target: "modweave_registry::init",
            mods = self.mods.len(),
            origins = self.enabled_origins.len(),
            "registry initialized"
        );
    }

    async fn restore(&mut self, record: StoredMod) -> Result<()> {
        let payload = BASE64
            .decode(record.payload.as_bytes())
            .map_err(|err| Error::Persistence(format!("stored payload: {err}")))?;
        let source = decompress(&payload)?;
        let descriptor = self.validator.validate(&source)?;
        let storage = ModStorage::new(record.storage);
        let providers = self.provider_handles();
        let compiled = self.compiler.compile(
            &source,
            descriptor,
            storage.clone(),
            CONTROLLER_CONTEXT,
            &providers,
        )?;
        let index = self.push_installed(
            compiled,
            payload,
            storage,
            record.enabled_on_origins,
            false,
        );
        self.fire_background(index, EventKind::Load);
        Ok(())
    }

    /// Installs a mod payload. Validation runs in a disposable realm,
    /// the trusted compile against this context; all requirements must
    /// resolve or nothing is persisted. A dev mod matching an installed
    /// dev mod's name+description hot-reloads, preserving storage and
    /// enabled origins; any other duplicate hash is rejected.
    pub async fn install(&mut self, payload: &[u8], dev: bool) -> Result<i32> {
        let source = decompress(payload)?;
        let mut descriptor = self.validator.validate(&source)?;
        descriptor.dev = dev;

        let mut preserved_storage = None;
        let mut preserved_origins = None;
        let existing = self.find_index_by_hash(descriptor.hash).or_else(|| {
            if dev {
                self.mods.iter().position(|m| {
                    m.compiled.descriptor.name == descriptor.name
                        && m.compiled.descriptor.description == descriptor.description
                })
            } else {
                None
            }
        });
        if let Some(index) = existing {
            let target = &self.mods[index];
            if target.compiled.descriptor.dev {
                preserved_storage = Some(target.storage.snapshot());
                preserved_origins = Some(target.enabled_on_origins.clone());
                let old_hash = target.compiled.descriptor.hash;
                self.uninstall(old_hash).await?;
            } else {
                return Err(Error::AlreadyInstalled);
            }
        }

        let storage = ModStorage::new(preserved_storage.unwrap_or_default());
        let providers = self.provider_handles();
        let compiled = self.compiler.compile(
            &source,
            descriptor,
            storage.clone(),
            CONTROLLER_CONTEXT,
            &providers,
        )?;
        let hash = compiled.descriptor.hash;
        let name = compiled.descriptor.name.clone();
        let index = self.push_installed(
            compiled,
            payload.to_vec(),
            storage,
            preserved_origins.unwrap_or_default(),
            dev,
        );
        self.fire_background(index, EventKind::Install);
        self.fire_background(index, EventKind::Load);
        self.persist().await;
        info!(target: "modweave_registry::install", mod_name = %name, hash, dev, "mod installed");
        Ok(hash)
    }

    /// Installs a batch in priority/dependency order, so providers land
    /// before their dependents regardless of input order. Each payload
    /// reports its own result; one failure does not stop the rest.
    pub async fn install_all(&mut self, payloads: Vec<Vec<u8>>, dev: bool) -> Vec<Result<i32>> {
        let mut staged: Vec<(Option<ModDescriptor>, Vec<u8>)> = Vec::new();
        for payload in payloads {
            let descriptor = decompress(&payload)
                .ok()
                .and_then(|source| self.validator.validate(&source).ok());
            staged.push((descriptor, payload));
        }
        sort_mods(&mut staged, |(descriptor, _)| {
            descriptor
                .as_ref()
                .map(|d| (d.priority, d.requirements.len()))
                .unwrap_or((0, 0))
        });
        let mut results = Vec::with_capacity(staged.len());
        for (_, payload) in staged {
            // Invalid payloads fail again here, with the real error.
            results.push(self.install(&payload, dev).await);
        }
        results
    }

    /// Uninstalls a mod and, first, every installed mod whose
    /// requirement on its dependency name is currently satisfied. The
    /// target's unload then uninstall callbacks fire exactly once each.
    /// Returns false when the hash is not installed.
    pub async fn uninstall(&mut self, hash: i32) -> Result<bool> {
        self.uninstall_boxed(hash).await
    }

    fn uninstall_boxed(&mut self, hash: i32) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let Some(index) = self.find_index_by_hash(hash) else {
                debug!(target: "modweave_registry::uninstall", hash, "not installed");
                return Ok(false);
            };
            let target = self.mods[index].compiled.descriptor.clone();

            if let Some(dependency_name) = target.dependency_name.clone() {
                // All dependents whose requirement this mod currently
                // satisfies go first. Order among them is unspecified.
                let dependents: Vec<i32> = self
                    .mods
                    .iter()
                    .filter(|m| m.compiled.descriptor.hash != hash)
                    .filter(|m| {
                        m.compiled.descriptor.requirements.iter().any(|req| {
                            req.dependency_name == dependency_name
                                && target.version >= req.min_version
                        })
                    })
                    .map(|m| m.compiled.descriptor.hash)
                    .collect();
                for dependent in dependents {
                    if let Err(err) = self.uninstall_boxed(dependent).await {
                        error!(
                            target: "modweave_registry::uninstall",
                            hash = dependent,
                            "cascading uninstall failed: {err}"
                        );
                    }
                }
            }

            let Some(index) = self.find_index_by_hash(hash) else {
                return Ok(false);
            };
            let origins = self.mods[index].enabled_on_origins.clone();
            for tab in self.tabs.query_tabs().await {
                if origins.contains(&tab.origin) {
                    if let Err(err) = self
                        .tabs
                        .send_to_tab(tab.id, json!({"type": "extract-mod", "data": hash}))
                        .await
                    {
                        warn!(target: "modweave_registry::uninstall", tab = tab.id, "extract notify failed: {err:#}");
                    }
                }
            }

            self.fire_background(index, EventKind::Unload);
            self.fire_background(index, EventKind::Uninstall);
            let removed = self.mods.remove(index);
            removed.compiled.destroy();
            self.persist().await;
            info!(
                target: "modweave_registry::uninstall",
                mod_name = %target.name,
                hash,
                "mod uninstalled"
            );
            Ok(true)
        })
    }

    /// Toggles one origin for one mod, enforcing the origin allowlist on
    /// enable. Enabling a response-modifying mod invalidates the
    /// origin's cache; matching tabs are told to inject or extract.
    pub async fn set_enabled_on_origin(
        &mut self,
        hash: i32,
        enabled: bool,
        origin: &str,
    ) -> Result<()> {
        let index = self.find_index_by_hash(hash).ok_or(Error::NotFound)?;
        let descriptor = self.mods[index].compiled.descriptor.clone();
        if enabled {
            if !descriptor.allows_origin(origin) {
                return Err(Error::origin_not_allowed(descriptor.name, origin));
            }
            let origins = &mut self.mods[index].enabled_on_origins;
            if !origins.iter().any(|o| o == origin) {
                origins.push(origin.to_string());
            }
            if descriptor.has_flag(ModFlag::ModifyRequest) {
                self.tabs.clear_origin_cache(origin).await;
            }
            self.fire_background(index, EventKind::Enabled(origin.to_string()));
            self.notify_origin_tabs(origin, json!({"type": "inject-mod", "data": hash}))
                .await;
        } else {
            self.mods[index]
                .enabled_on_origins
                .retain(|o| o != origin);
            self.fire_background(index, EventKind::Disable(origin.to_string()));
            self.notify_origin_tabs(origin, json!({"type": "extract-mod", "data": hash}))
                .await;
        }
        self.persist().await;
        Ok(())
    }

    pub fn is_enabled_on_origin(&self, hash: i32, origin: &str) -> Result<bool> {
        let installed = self.find_by_hash(hash).ok_or(Error::NotFound)?;
        let descriptor = &installed.compiled.descriptor;
        if !descriptor.origins.is_empty() && !descriptor.allows_origin(origin) {
            return Ok(false);
        }
        Ok(installed.enabled_on_origins.iter().any(|o| o == origin))
    }

    /// Status report for one mod on one origin: enablement, a
    /// descriptive dependency error when requirements are unmet, and an
    /// advisory list of satisfied dependents.
    pub fn mod_status(&self, hash: i32, origin: &str) -> Result<ModStatus> {
        let installed = self.find_by_hash(hash).ok_or(Error::NotFound)?;
        let descriptor = &installed.compiled.descriptor;
        let enabled = self.is_enabled_on_origin(hash, origin)?;

        let dependency_error = descriptor.requirements.iter().find_map(|req| {
            match self.provider_version(&req.dependency_name) {
                None => Some(format!(
                    "missing dependency `{}-{}`+",
                    req.dependency_name, req.min_version
                )),
                Some(installed_version) if installed_version < req.min_version => Some(format!(
                    "dependency `{}` version mismatch: required {}, installed {}",
                    req.dependency_name, req.min_version, installed_version
                )),
                Some(_) => None,
            }
        });

        let required_by = match descriptor.dependency_name.as_deref() {
            None => Vec::new(),
            Some(dependency_name) => self
                .mods
                .iter()
                .filter(|m| m.compiled.descriptor.hash != hash)
                .filter(|m| {
                    m.compiled.descriptor.requirements.iter().any(|req| {
                        req.dependency_name == dependency_name
                            && descriptor.version >= req.min_version
                    })
                })
                .map(|m| m.compiled.descriptor.name.clone())
                .collect(),
        };

        Ok(ModStatus {
            enabled,
            dependency_error,
            required_by,
        })
    }

    pub async fn add_origin(&mut self, origin: &str) {
        if !self.enabled_origins.iter().any(|o| o == origin) {
            self.enabled_origins.push(origin.to_string());
        }
        self.persist_origins().await;
    }

    /// Drops an origin globally, including from every mod's enablement.
    pub async fn remove_origin(&mut self, origin: &str) {
        self.enabled_origins.retain(|o| o != origin);
        for installed in &mut self.mods {
            installed.enabled_on_origins.retain(|o| o != origin);
        }
        self.persist_origins().await;
        self.persist().await;
    }

    pub fn enabled_origins(&self) -> &[String] {
        &self.enabled_origins
    }

    pub async fn set_origin_settings(&mut self, origin: &str, settings: Value) {
        self.origin_settings.insert(origin.to_string(), settings);
        if let Ok(value) = serde_json::to_value(&self.origin_settings) {
            if let Err(err) = self.saver.store().set(ORIGIN_SETTINGS_KEY, value).await {
                warn!(target: "modweave_registry::saver", "origin settings write failed: {err:#}");
            }
        }
    }

    pub fn origin_settings(&self, origin: &str) -> Option<&Value> {
        self.origin_settings.get(origin)
    }

    /// Installed descriptors, optionally filtered to those whose
    /// allowlist covers `origin`.
    pub fn installed_meta(&self, origin: Option<&str>) -> Vec<ModDescriptor> {
        self.mods
            .iter()
            .filter(|m| origin.is_none_or(|o| m.compiled.descriptor.allows_origin(o)))
            .map(|m| m.compiled.descriptor.clone())
            .collect()
    }

    /// Hashes of mods enabled on `origin`, in registry order.
    pub fn origin_mods(&self, origin: &str) -> Vec<i32> {
        self.mods
            .iter()
            .map(|m| m.compiled.descriptor.hash)
            .filter(|&hash| self.is_enabled_on_origin(hash, origin).unwrap_or(false))
            .collect()
    }

    /// A new tab appeared. The first tab after none resumes background
    /// mods with a load event.
    pub fn notify_tab_created(&mut self, tab: u64, origin: &str) {
        let was_empty = self.open_tabs.is_empty();
        self.open_tabs.insert(tab, origin.to_string());
        if was_empty {
            for index in 0..self.mods.len() {
                self.fire_background(index, EventKind::Load);
            }
        }
    }

    /// A tab went away. Closing the last one suspends background mods
    /// with an unload event; their per-tab slots are dropped either way.
    pub fn notify_tab_removed(&mut self, tab: u64) {
        self.open_tabs.remove(&tab);
        for installed in &mut self.mods {
            installed.tab_data.remove(&tab);
        }
        if self.open_tabs.is_empty() {
            for index in 0..self.mods.len() {
                self.fire_background(index, EventKind::Unload);
            }
        }
    }

    /// Forwards an injector-side lifecycle event to the owning mod and
    /// returns the guest's reply, when it produced one.
    pub fn injector_event(
        &mut self,
        hash: i32,
        tab: u64,
        event: InjectorEvent,
    ) -> Result<Option<Value>> {
        let index = self.find_index_by_hash(hash).ok_or(Error::NotFound)?;
        let origin = self.open_tabs.get(&tab).cloned().unwrap_or_default();
        let installed = &mut self.mods[index];
        if !installed.compiled.descriptor.has_flag(ModFlag::BackgroundScript) {
            return Ok(None);
        }
        let context = BackgroundContext {
            global: installed.global.clone(),
            tab: Some(TabContext {
                id: tab,
                data: installed.tab_data.get(&tab).cloned().unwrap_or(Value::Null),
            }),
        };
        let enabled = installed.enabled_on_origins.clone();
        let event = match event {
            InjectorEvent::Load => BackgroundEvent::InjectorLoad {
                context,
                enabled,
                origin,
            },
            InjectorEvent::Unload => BackgroundEvent::InjectorUnload {
                context,
                enabled,
                origin,
            },
            InjectorEvent::Message(data) => BackgroundEvent::InjectorMessage {
                context,
                enabled,
                data,
            },
        };
        match installed.compiled.background(&event) {
            Ok(result) => {
                if let Some(value) = &result {
                    if let Some(tab_value) = value.get("tab") {
                        installed.tab_data.insert(tab, tab_value.clone());
                    }
                }
                Ok(Self::apply_background_result(installed, result))
            }
            Err(err) => {
                installed.record_error(err.to_string());
                Ok(None)
            }
        }
    }

    pub fn mod_errors(&self, hash: i32) -> Result<Vec<String>> {
        Ok(self.find_by_hash(hash).ok_or(Error::NotFound)?.errors())
    }

    pub fn mod_storage(&self, hash: i32) -> Result<ModStorage> {
        Ok(self
            .find_by_hash(hash)
            .ok_or(Error::NotFound)?
            .storage
            .clone())
    }

    pub fn find_by_hash(&self, hash: i32) -> Option<&InstalledMod> {
        self.mods.iter().find(|m| m.compiled.descriptor.hash == hash)
    }

    pub fn installed_count(&self) -> usize {
        self.mods.len()
    }

    /// Writes the registry snapshot through the coalescing saver.
    pub async fn persist_now(&self) {
        self.persist().await;
    }

    fn find_index_by_hash(&self, hash: i32) -> Option<usize> {
        self.mods
            .iter()
            .position(|m| m.compiled.descriptor.hash == hash)
    }

    fn provider_version(&self, dependency_name: &str) -> Option<Version> {
        self.mods
            .iter()
            .find(|m| m.compiled.descriptor.dependency_name.as_deref() == Some(dependency_name))
            .map(|m| m.compiled.descriptor.version.clone())
    }

    fn provider_handles(&mut self) -> Vec<ProviderHandle> {
        let mut handles = Vec::new();
        for installed in self.mods.iter_mut() {
            let Some(name) = installed.compiled.descriptor.dependency_name.clone() else {
                continue;
            };
            let methods = match installed.compiled.export_methods() {
                Ok(methods) => methods,
                Err(err) => {
                    installed.record_error(err.to_string());
                    Value::Null
                }
            };
            handles.push(ProviderHandle {
                dependency_name: name,
                version: installed.compiled.descriptor.version.clone(),
                methods,
            });
        }
        handles
    }

    fn push_installed(
        &mut self,
        mut compiled: CompiledMod,
        payload: Vec<u8>,
        storage: ModStorage,
        enabled_on_origins: Vec<String>,
        dev: bool,
    ) -> usize {
        compiled.descriptor.dev = dev;
        self.mods.push(InstalledMod {
            compiled,
            payload,
            storage,
            enabled_on_origins,
            errors: VecDeque::new(),
            global: json!({}),
            tab_data: HashMap::new(),
        });
        self.mods.len() - 1
    }

    fn fire_background(&mut self, index: usize, kind: EventKind) {
        let Some(installed) = self.mods.get_mut(index) else {
            return;
        };
        if !installed.compiled.descriptor.has_flag(ModFlag::BackgroundScript) {
            return;
        }
        let context = BackgroundContext {
            global: installed.global.clone(),
            tab: None,
        };
        let enabled = installed.enabled_on_origins.clone();
        let event = match kind {
            EventKind::Install => BackgroundEvent::Install { context, enabled },
            EventKind::Uninstall => BackgroundEvent::Uninstall { context, enabled },
            EventKind::Load => BackgroundEvent::Load { context, enabled },
            EventKind::Unload => BackgroundEvent::Unload { context, enabled },
            EventKind::Enabled(origin) => BackgroundEvent::Enabled {
                context,
                enabled,
                origin,
            },
            EventKind::Disable(origin) => BackgroundEvent::Disable {
                context,
                enabled,
                origin,
            },
        };
        // A callback throwing lands in the mod's error log and never
        // aborts the surrounding registry operation.
        match installed.compiled.background(&event) {
            Ok(result) => {
                Self::apply_background_result(installed, result);
            }
            Err(err) => installed.record_error(err.to_string()),
        }
    }

    /// The guest's background response may carry a replacement `global`
    /// and a `reply` for the event's originator.
    fn apply_background_result(
        installed: &mut InstalledMod,
        result: Option<Value>,
    ) -> Option<Value> {
        let value = result?;
        if let Some(global) = value.get("global") {
            installed.global = global.clone();
        }
        value.get("reply").cloned()
    }

    async fn notify_origin_tabs(&self, origin: &str, envelope: Value) {
        for tab in self.tabs.query_tabs().await {
            if tab.origin == origin {
                if let Err(err) = self.tabs.send_to_tab(tab.id, envelope.clone()).await {
                    warn!(target: "modweave_registry::tabs", tab = tab.id, "notify failed: {err:#}");
                }
            }
        }
    }

    async fn persist(&self) {
        // Dev mods never persist.
        let snapshot: Vec<StoredMod> = self
            .mods
            .iter()
            .filter(|m| !m.compiled.descriptor.dev)
            .map(|m| StoredMod {
                payload: BASE64.encode(&m.payload),
                descriptor: m.compiled.descriptor.clone(),
                storage: m.storage.snapshot(),
                enabled_on_origins: m.enabled_on_origins.clone(),
            })
            .collect();
        self.saver.save(snapshot).await;
    }

    async fn persist_origins(&self) {
        if let Err(err) = self
            .saver
            .store()
            .set(ORIGIN_KEY, json!(self.enabled_origins))
            .await
        {
            warn!(target: "modweave_registry::saver", "origin write failed: {err:#}");
        }
    }
}

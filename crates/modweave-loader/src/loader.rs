use std::collections::VecDeque;
use std::sync::Arc;

use modweave_api::{BackgroundContext, BackgroundEvent, ModDescriptor, ModFlag};
use modweave_sandbox::{CompiledMod, ProviderHandle, TrustedCompiler, decompress};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::host::{DialogHost, GuiHandle, LoaderHost, ToastKind, Toaster};

/// Storage context key of the page-injected agent context.
const AGENT_CONTEXT: &str = "agent";

/// Session settings the relay hands over during the handshake.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// Strict stealth: no toasts, no loader chrome.
    pub stealth_strict: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            stealth_strict: true,
        }
    }
}

/// What the controller ships for one mod: the validated descriptor plus
/// the (possibly compressed) source payload.
#[derive(Debug, Clone)]
pub struct ModBundle {
    pub descriptor: ModDescriptor,
    pub payload: Vec<u8>,
}

enum Action {
    Load(Box<ModBundle>, bool),
    Extract(i32),
}

/// Keeps the mods of one browsing context running: queued actions,
/// per-context compilation, dependency method binding, and teardown.
pub struct ModLoader<H: LoaderHost> {
    host: Arc<H>,
    dialogs: Arc<dyn DialogHost>,
    toaster: Arc<dyn Toaster>,
    gui: Arc<dyn GuiHandle>,
    settings: LoaderSettings,
    compiler: TrustedCompiler,
    running: Vec<CompiledMod>,
    actions: VecDeque<Action>,
    processing: bool,
}

impl<H: LoaderHost> ModLoader<H> {
    pub fn new(
        host: Arc<H>,
        dialogs: Arc<dyn DialogHost>,
        toaster: Arc<dyn Toaster>,
        gui: Arc<dyn GuiHandle>,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            host,
            dialogs,
            toaster,
            gui,
            settings,
            compiler: TrustedCompiler::new(),
            running: Vec::new(),
            actions: VecDeque::new(),
            processing: false,
        }
    }

    pub fn set_settings(&mut self, settings: LoaderSettings) {
        self.settings = settings;
    }

    pub fn open_gui(&self) {
        self.gui.show();
    }

    pub fn close_gui(&self) {
        self.gui.hide();
    }

    /// Queues a mod for injection. A queued load for the same hash is
    /// replaced, so rapid re-sends collapse into one action.
    pub fn queue_load(&mut self, bundle: ModBundle, show_prompt: bool) {
        let hash = bundle.descriptor.hash;
        self.actions
            .retain(|a| !matches!(a, Action::Load(queued, _) if queued.descriptor.hash == hash));
        let prompt = show_prompt && bundle.descriptor.has_flag(ModFlag::ModifyRequest);
        self.actions.push_back(Action::Load(Box::new(bundle), prompt));
    }

    /// Queues extraction of a running mod; duplicates collapse.
    pub fn queue_extract(&mut self, hash: i32) {
        self.actions
            .retain(|a| !matches!(a, Action::Extract(queued) if *queued == hash));
        if self.is_running(hash) {
            self.actions.push_back(Action::Extract(hash));
        }
    }

    /// Drains the action queue, one action at a time. A failing action
    /// is reported and does not stop the rest.
    pub async fn process(&mut self) {
        if self.processing {
            return;
        }
        self.processing = true;
        while let Some(action) = self.actions.pop_front() {
            match action {
                Action::Load(bundle, prompt) => {
                    let hash = bundle.descriptor.hash;
                    if let Err(err) = self.load_mod(*bundle, prompt).await {
                        error!(target: "modweave_loader::queue", hash, "load failed: {err}");
                    }
                }
                Action::Extract(hash) => {
                    if let Err(err) = self.unload_mod(hash, true).await {
                        error!(target: "modweave_loader::queue", hash, "unload failed: {err}");
                    }
                }
            }
        }
        self.processing = false;
    }

    async fn load_mod(&mut self, bundle: ModBundle, show_prompt: bool) -> Result<()> {
        let descriptor = bundle.descriptor;
        let hash = descriptor.hash;
        if self.is_running(hash) {
            self.toast(
                "Mod loader",
                &format!("Mod \"{}\" is already active", descriptor.name),
                ToastKind::Info,
            );
            return Ok(());
        }
        if show_prompt {
            let refresh = self
                .dialogs
                .confirm(&format!(
                    "The mod \"{}\" requires code modification.\nWould you like to refresh the page?",
                    descriptor.name
                ))
                .await;
            if refresh {
                self.host.reload_page().await;
                return Ok(());
            }
        }
        self.toast(
            "Mod loader",
            &format!("Loading \"{}\"", descriptor.name),
            ToastKind::Info,
        );

        let result = self.compile_and_start(descriptor.clone(), &bundle.payload);
        match result {
            Ok(compiled) => {
                self.running.push(compiled);
                self.host.on_mod_load(hash);
                info!(target: "modweave_loader::mods", mod_name = %descriptor.name, hash, "mod loaded");
                self.toast(
                    "Mod loader",
                    &format!("Loaded \"{}\"", descriptor.name),
                    ToastKind::Info,
                );
                Ok(())
            }
            Err(err) => {
                self.host.on_mod_error(hash, &err.to_string());
                self.toast(
                    "Mod loader",
                    &format!("An error has occurred on mod enable \"{}\"", descriptor.name),
                    ToastKind::Error,
                );
                Err(err)
            }
        }
    }

    fn compile_and_start(&mut self, descriptor: ModDescriptor, payload: &[u8]) -> Result<CompiledMod> {
        let source = decompress(payload)?;
        let providers = self.provider_handles();
        let storage = self.host.storage_for(descriptor.hash);
        let mut compiled =
            self.compiler
                .compile(&source, descriptor, storage, AGENT_CONTEXT, &providers)?;
        compiled.on_load()?;
        Ok(compiled)
    }

    /// Unloads one running mod. Interactive unloads honor the
    /// `disable-unload` flag (refresh instead) and offer a refresh for
    /// response-modifying mods; forced unloads (context teardown) skip
    /// the questions. Returns false when the mod stays.
    pub async fn unload_mod(&mut self, hash: i32, interactive: bool) -> Result<bool> {
        let Some(index) = self.running.iter().position(|m| m.descriptor.hash == hash) else {
            debug!(target: "modweave_loader::mods", hash, "unload of a mod that is not running");
            return Ok(false);
        };
        let descriptor = self.running[index].descriptor.clone();
        if interactive && descriptor.has_flag(ModFlag::DisableUnload) {
            let refresh = self
                .dialogs
                .confirm(&format!(
                    "Mod {} has disabled the unloading feature!\nPage refresh is required!\nWould you like to refresh now?",
                    descriptor.name
                ))
                .await;
            if refresh {
                self.host.reload_page().await;
            }
            return Ok(false);
        }
        if interactive && descriptor.has_flag(ModFlag::ModifyRequest) {
            let refresh = self
                .dialogs
                .confirm(&format!(
                    "The mod \"{}\" is a code modifier.\nWould you like to refresh the page to clean up?",
                    descriptor.name
                ))
                .await;
            if refresh {
                self.host.reload_page().await;
                return Ok(false);
            }
        }

        self.toast(
            "Mod loader",
            &format!("Unloading \"{}\"", descriptor.name),
            ToastKind::Info,
        );
        // The mod leaves the running set whatever on_unload does; its
        // realm is reclaimed when the compiled mod drops.
        let mut leaving = self.running.remove(index);
        if let Err(err) = leaving.on_unload() {
            self.host.on_mod_error(hash, &err.to_string());
            self.toast(
                "Mod loader",
                &format!("Unable to unload mod \"{}\"", descriptor.name),
                ToastKind::Error,
            );
        }
        self.host.on_mod_unload(hash);
        info!(target: "modweave_loader::mods", mod_name = %descriptor.name, hash, "mod unloaded");
        Ok(true)
    }

    /// Context teardown: providers last, so dependents never outlive
    /// what they bind to. Forced, no dialogs.
    pub async fn destroy(&mut self) {
        let non_providers: Vec<i32> = self
            .running
            .iter()
            .filter(|m| m.descriptor.dependency_name.is_none())
            .map(|m| m.descriptor.hash)
            .collect();
        for hash in non_providers {
            let _ = self.unload_mod(hash, false).await;
        }
        let rest: Vec<i32> = self.running.iter().map(|m| m.descriptor.hash).collect();
        for hash in rest {
            let _ = self.unload_mod(hash, false).await;
        }
        self.gui.hide();
    }

    /// A message from the controller for one running mod. The guest's
    /// `reply` field is the response.
    pub fn receive_message(&mut self, hash: i32, data: Value) -> Result<Value> {
        let Some(running) = self.running.iter_mut().find(|m| m.descriptor.hash == hash) else {
            return Err(Error::NotLoaded(hash));
        };
        let event = BackgroundEvent::InjectorMessage {
            context: BackgroundContext::default(),
            enabled: Vec::new(),
            data,
        };
        match running.background(&event)? {
            Some(response) => Ok(response.get("reply").cloned().unwrap_or(Value::Null)),
            None => Err(Error::NoHandler),
        }
    }

    /// Relay of a guest-originated message towards the controller — the
    /// send half of the background channel.
    pub async fn mod_message_to_controller(
        &self,
        hash: i32,
        data: Value,
    ) -> anyhow::Result<Value> {
        self.host.on_mod_message(hash, data).await
    }

    pub fn queued_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn is_running(&self, hash: i32) -> bool {
        self.running.iter().any(|m| m.descriptor.hash == hash)
    }

    pub fn active_mods(&self) -> Vec<i32> {
        self.running.iter().map(|m| m.descriptor.hash).collect()
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    fn provider_handles(&mut self) -> Vec<ProviderHandle> {
        let mut handles = Vec::new();
        for running in self.running.iter_mut() {
            let Some(name) = running.descriptor.dependency_name.clone() else {
                continue;
            };
            let methods = running.export_methods().unwrap_or(Value::Null);
            handles.push(ProviderHandle {
                dependency_name: name,
                version: running.descriptor.version.clone(),
                methods,
            });
        }
        handles
    }

    fn toast(&self, title: &str, message: &str, kind: ToastKind) {
        if !self.settings.stealth_strict {
            self.toaster.show(title, message, kind);
        }
    }
}

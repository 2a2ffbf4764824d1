use async_trait::async_trait;
use modweave_api::ModStorage;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Info,
    Warn,
    Error,
}

/// Toast surface of the page UI. Rendering is an excluded collaborator;
/// strict stealth suppresses these entirely.
pub trait Toaster: Send + Sync {
    fn show(&self, title: &str, message: &str, kind: ToastKind);
}

/// Modal dialog surface of the page UI.
#[async_trait]
pub trait DialogHost: Send + Sync {
    async fn alert(&self, message: &str);
    async fn confirm(&self, message: &str) -> bool;
    async fn prompt(&self, message: &str, default_value: &str) -> String;
}

/// The mod panel handle mods receive.
pub trait GuiHandle: Send + Sync {
    fn show(&self);
    fn hide(&self);
}

/// Everything the loader needs from its embedding context: lifecycle
/// notifications, storage, message relay to the controller, and the page
/// refresh primitive.
#[async_trait]
pub trait LoaderHost: Send + Sync {
    fn on_mod_load(&self, _hash: i32) {}
    fn on_mod_unload(&self, _hash: i32) {}
    fn on_mod_error(&self, _hash: i32, _message: &str) {}

    /// Storage backing one mod in this context. Real embedders relay to
    /// the controller; the default is context-local scratch.
    fn storage_for(&self, _hash: i32) -> ModStorage {
        ModStorage::default()
    }

    /// A background-capable mod sent data towards the controller.
    async fn on_mod_message(&self, _hash: i32, _data: Value) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    /// Reloads the page; mods that refuse live unload go through here.
    async fn reload_page(&self) {}
}

/// No-surface defaults for tests and headless embedders.
#[derive(Debug, Default)]
pub struct NullToaster;

impl Toaster for NullToaster {
    fn show(&self, _title: &str, _message: &str, _kind: ToastKind) {}
}

#[derive(Debug, Default)]
pub struct NullGui;

impl GuiHandle for NullGui {
    fn show(&self) {}
    fn hide(&self) {}
}

/// Dialogs that decline everything.
#[derive(Debug, Default)]
pub struct SilentDialogs;

#[async_trait]
impl DialogHost for SilentDialogs {
    async fn alert(&self, _message: &str) {}

    async fn confirm(&self, _message: &str) -> bool {
        false
    }

    async fn prompt(&self, _message: &str, default_value: &str) -> String {
        default_value.to_string()
    }
}

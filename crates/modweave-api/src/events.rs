use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-tab slot handed to injector events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabContext {
    pub id: u64,
    #[serde(default)]
    pub data: Value,
}

/// Context shared with every background event: the mod's persistent
/// `global` object and, for injector events, the originating tab.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackgroundContext {
    #[serde(default)]
    pub global: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabContext>,
}

/// Lifecycle event delivered to `background-script` mods, discriminated
/// on `type`. Serialized to JSON at the guest boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackgroundEvent {
    #[serde(rename = "mod-install")]
    Install {
        context: BackgroundContext,
        enabled: Vec<String>,
    },
    #[serde(rename = "mod-uninstall")]
    Uninstall {
        context: BackgroundContext,
        enabled: Vec<String>,
    },
    #[serde(rename = "mod-load")]
    Load {
        context: BackgroundContext,
        enabled: Vec<String>,
    },
    #[serde(rename = "mod-unload")]
    Unload {
        context: BackgroundContext,
        enabled: Vec<String>,
    },
    #[serde(rename = "mod-enabled")]
    Enabled {
        context: BackgroundContext,
        enabled: Vec<String>,
        origin: String,
    },
    #[serde(rename = "mod-disable")]
    Disable {
        context: BackgroundContext,
        enabled: Vec<String>,
        origin: String,
    },
    #[serde(rename = "mod-injector-load")]
    InjectorLoad {
        context: BackgroundContext,
        enabled: Vec<String>,
        origin: String,
    },
    #[serde(rename = "mod-injector-unload")]
    InjectorUnload {
        context: BackgroundContext,
        enabled: Vec<String>,
        origin: String,
    },
    #[serde(rename = "mod-injector-message")]
    InjectorMessage {
        context: BackgroundContext,
        enabled: Vec<String>,
        data: Value,
    },
}

impl BackgroundEvent {
    pub fn context(&self) -> &BackgroundContext {
        match self {
            Self::Install { context, .. }
            | Self::Uninstall { context, .. }
            | Self::Load { context, .. }
            | Self::Unload { context, .. }
            | Self::Enabled { context, .. }
            | Self::Disable { context, .. }
            | Self::InjectorLoad { context, .. }
            | Self::InjectorUnload { context, .. }
            | Self::InjectorMessage { context, .. } => context,
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which storage tier an accessor targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageScope {
    /// Shared across every context the mod runs in.
    Shared,
    /// Scoped to one context key (a tab, the controller, ...).
    Local,
}

impl StorageScope {
    pub fn from_abi(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Shared),
            1 => Some(Self::Local),
            _ => None,
        }
    }
}

/// Two-tier persistent storage of one mod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModStorageData {
    #[serde(default)]
    pub shared: HashMap<String, Value>,
    #[serde(default)]
    pub local: HashMap<String, HashMap<String, Value>>,
}

/// Shared handle to one mod's storage. The registry owns the handle for
/// persistence; realms mutate it through bound accessors only.
#[derive(Debug, Clone, Default)]
pub struct ModStorage {
    inner: Arc<Mutex<ModStorageData>>,
}

impl ModStorage {
    pub fn new(data: ModStorageData) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }

    pub fn get(&self, scope: StorageScope, context: &str, key: &str) -> Option<Value> {
        let data = self.inner.lock().ok()?;
        match scope {
            StorageScope::Shared => data.shared.get(key).cloned(),
            StorageScope::Local => data.local.get(context).and_then(|m| m.get(key)).cloned(),
        }
    }

    pub fn set(&self, scope: StorageScope, context: &str, key: &str, value: Value) {
        let Ok(mut data) = self.inner.lock() else {
            return;
        };
        match scope {
            StorageScope::Shared => {
                data.shared.insert(key.to_string(), value);
            }
            StorageScope::Local => {
                data.local
                    .entry(context.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
        }
    }

    pub fn delete(&self, scope: StorageScope, context: &str, key: &str) {
        let Ok(mut data) = self.inner.lock() else {
            return;
        };
        match scope {
            StorageScope::Shared => {
                data.shared.remove(key);
            }
            StorageScope::Local => {
                if let Some(bucket) = data.local.get_mut(context) {
                    bucket.remove(key);
                }
            }
        }
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self) -> ModStorageData {
        self.inner.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use modweave_api::{ModDescriptor, ModStorageData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Key holding the installed-mod registry.
pub const MOD_KEY: &str = "__MODS__";
/// Key holding the global enabled-origin list.
pub const ORIGIN_KEY: &str = "__ORIGINS__";
/// Key holding per-origin settings.
pub const ORIGIN_SETTINGS_KEY: &str = "__ORIGINS_SETTINGS__";

/// Persistent key-value collaborator. The registry never touches disk
/// directly; whatever backs this trait does.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// In-memory store; the default for tests and embedders without a host
/// store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, Value>>,
    writes: AtomicUsize,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed `set` calls, for save-coalescing assertions.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("store poisoned"))?
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("store poisoned"))?
            .insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("store poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// One installed mod as it persists: source payload, validated
/// descriptor, storage snapshot, enabled origins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMod {
    pub payload: String,
    pub descriptor: ModDescriptor,
    pub storage: ModStorageData,
    pub enabled_on_origins: Vec<String>,
}

#[derive(Debug, Default)]
struct SaverState {
    saving: bool,
    pending: Option<Vec<StoredMod>>,
}

/// Serializes registry writes: one writer at a time, and a save
/// requested while one is in flight is deferred and re-run exactly once
/// after the in-flight write completes.
pub struct ModSaver<K: KvStore> {
    kv: Arc<K>,
    state: Mutex<SaverState>,
}

impl<K: KvStore> ModSaver<K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self {
            kv,
            state: Mutex::new(SaverState::default()),
        }
    }

    pub fn store(&self) -> &Arc<K> {
        &self.kv
    }

    pub async fn load(&self) -> Vec<StoredMod> {
        let raw = match self.kv.get(MOD_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(error) => {
                warn!(target: "modweave_registry::saver", "load failed: {error:#}");
                return Vec::new();
            }
        };
        match serde_json::from_value(raw) {
            Ok(mods) => mods,
            Err(error) => {
                warn!(target: "modweave_registry::saver", "stored registry does not parse: {error}");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, snapshot: Vec<StoredMod>) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.saving {
                debug!(target: "modweave_registry::saver", "save deferred behind in-flight write");
                state.pending = Some(snapshot);
                return;
            }
            state.saving = true;
        }

        let mut current = snapshot;
        loop {
            let count = current.len();
            match serde_json::to_value(&current) {
                Ok(value) => {
                    if let Err(error) = self.kv.set(MOD_KEY, value).await {
                        warn!(target: "modweave_registry::saver", "write failed: {error:#}");
                    } else {
                        debug!(target: "modweave_registry::saver", count, "registry saved");
                    }
                }
                Err(error) => {
                    warn!(target: "modweave_registry::saver", "unserializable registry: {error}");
                }
            }

            let next = {
                let Ok(mut state) = self.state.lock() else {
                    return;
                };
                match state.pending.take() {
                    Some(pending) => Some(pending),
                    None => {
                        state.saving = false;
                        None
                    }
                }
            };
            match next {
                Some(pending) => current = pending,
                None => break,
            }
        }
    }
}

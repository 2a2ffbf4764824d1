use std::sync::Arc;

use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use modweave_api::StorageScope;
use modweave_bus::EventHandler;

use crate::registry::{InjectorEvent, ModRegistry};
use crate::store::KvStore;
use crate::tabs::TabBridge;

/// Wires the controller's bus surface onto a shared registry. Handler
/// failures become rejected replies on the wire; nothing here panics the
/// dispatch loop.
pub fn register_controller_handlers<K, T>(
    bus: &EventHandler,
    registry: Arc<Mutex<ModRegistry<K, T>>>,
) where
    K: KvStore + 'static,
    T: TabBridge + 'static,
{
    let reg = Arc::clone(&registry);
    bus.on_promise("get-installed", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let origin = data.get("origin").and_then(Value::as_str).map(str::to_string);
            let meta = reg.lock().await.installed_meta(origin.as_deref());
            serde_json::to_value(meta).context("serialize installed meta")
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("mod-install", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let payload = data
                .get("payload")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("mod-install needs a payload"))?
                .to_string();
            let dev = data.get("dev").and_then(Value::as_bool).unwrap_or(false);
            let hash = reg.lock().await.install(payload.as_bytes(), dev).await?;
            Ok(json!({"hash": hash}))
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("mod-uninstall", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let hash = require_hash(&data)?;
            let removed = reg.lock().await.uninstall(hash).await?;
            Ok(json!({"removed": removed}))
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("get-mod-state", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let hash = require_hash(&data)?;
            let origin = require_str(&data, "origin")?;
            let status = reg.lock().await.mod_status(hash, &origin)?;
            serde_json::to_value(status).context("serialize mod status")
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("set-mod-state", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let hash = require_hash(&data)?;
            let origin = require_str(&data, "origin")?;
            let enabled = data
                .get("enabled")
                .and_then(Value::as_bool)
                .ok_or_else(|| anyhow!("set-mod-state needs `enabled`"))?;
            reg.lock()
                .await
                .set_enabled_on_origin(hash, enabled, &origin)
                .await?;
            Ok(Value::Null)
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("origin-add", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let origin = require_str(&data, "origin")?;
            reg.lock().await.add_origin(&origin).await;
            Ok(Value::Null)
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("origin-remove", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let origin = require_str(&data, "origin")?;
            reg.lock().await.remove_origin(&origin).await;
            Ok(Value::Null)
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("injector-mod-load", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let (hash, tab) = require_injector_target(&data)?;
            reg.lock().await.injector_event(hash, tab, InjectorEvent::Load)?;
            Ok(Value::Null)
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("injector-mod-unload", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let (hash, tab) = require_injector_target(&data)?;
            reg.lock()
                .await
                .injector_event(hash, tab, InjectorEvent::Unload)?;
            Ok(Value::Null)
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("injector-mod-message", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let (hash, tab) = require_injector_target(&data)?;
            let message = data.get("data").cloned().unwrap_or(Value::Null);
            let reply = reg
                .lock()
                .await
                .injector_event(hash, tab, InjectorEvent::Message(message))?;
            Ok(reply.unwrap_or(Value::Null))
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("mod-storage-update", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let hash = require_hash(&data)?;
            let key = require_str(&data, "key")?;
            let scope = match data.get("scope").and_then(Value::as_i64).unwrap_or(0) {
                0 => StorageScope::Shared,
                _ => StorageScope::Local,
            };
            let context = data
                .get("context")
                .and_then(Value::as_str)
                .unwrap_or("relay")
                .to_string();
            let registry = reg.lock().await;
            let storage = registry.mod_storage(hash)?;
            match data.get("value") {
                Some(value) => storage.set(scope, &context, &key, value.clone()),
                None => storage.delete(scope, &context, &key),
            }
            registry.persist_now().await;
            Ok(Value::Null)
        }
    });

    let reg = Arc::clone(&registry);
    bus.on_promise("get-mod-errors", move |data| {
        let reg = Arc::clone(&reg);
        async move {
            let hash = require_hash(&data)?;
            let errors = reg.lock().await.mod_errors(hash)?;
            Ok(json!(errors))
        }
    });
}

fn require_hash(data: &Value) -> anyhow::Result<i32> {
    data.get("hash")
        .and_then(Value::as_i64)
        .map(|h| h as i32)
        .ok_or_else(|| anyhow!("missing `hash`"))
}

fn require_str(data: &Value, field: &str) -> anyhow::Result<String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing `{field}`"))
}

fn require_injector_target(data: &Value) -> anyhow::Result<(i32, u64)> {
    let hash = require_hash(data)?;
    let tab = data
        .get("tab")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("missing `tab`"))?;
    Ok((hash, tab))
}

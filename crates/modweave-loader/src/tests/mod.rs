
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use modweave_api::ModStorage;
use serde_json::{Value, json};

use crate::host::LoaderHost;

pub(crate) fn escape_wat(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:02x}")).collect()
}

pub(crate) fn mod_source(name: &str, extra: &str, imports: &str, body: &str) -> String {
    let metadata = format!(
        r#"{{"abi_version":1,"name":"{name}","description":"test mod","version":"1.0.0"{extra}}}"#
    );
    format!(
        r#"(module
{imports}
  (memory (export "memory") 1)
  (data (i32.const 1024) "{data}")
  (func (export "mod_metadata_ptr") (result i32) i32.const 1024)
  (func (export "mod_metadata_len") (result i32) i32.const {len})
{body})"#,
        data = escape_wat(metadata.as_bytes()),
        len = metadata.len(),
    )
}

/// A mod whose lifecycle hooks leave marks in shared storage.
pub(crate) fn marking_mod(name: &str, extra: &str) -> String {
    mod_source(
        name,
        extra,
        r#"  (import "modweave" "storage_set" (func $sset (param i32 i32 i32 i32 i32)))"#,
        r#"  (data (i32.const 0) "loaded")
  (data (i32.const 8) "unloaded")
  (data (i32.const 32) "1")
  (func (export "on_load")
    (call $sset (i32.const 0) (i32.const 0) (i32.const 6) (i32.const 32) (i32.const 1)))
  (func (export "on_unload")
    (call $sset (i32.const 0) (i32.const 8) (i32.const 8) (i32.const 32) (i32.const 1)))"#,
    )
}

/// Loader host recording lifecycle callbacks and handing out stable
/// storage per hash.
#[derive(Default)]
pub(crate) struct RecordingHost {
    pub events: Mutex<Vec<String>>,
    storages: Mutex<HashMap<i32, ModStorage>>,
}

impl RecordingHost {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events").clone()
    }

    pub fn storage(&self, hash: i32) -> ModStorage {
        self.storages
            .lock()
            .expect("storages")
            .entry(hash)
            .or_default()
            .clone()
    }

    fn record(&self, event: String) {
        self.events.lock().expect("events").push(event);
    }
}

#[async_trait]
impl LoaderHost for Arc<RecordingHost> {
    fn on_mod_load(&self, hash: i32) {
        self.record(format!("load:{hash}"));
    }

    fn on_mod_unload(&self, hash: i32) {
        self.record(format!("unload:{hash}"));
    }

    fn on_mod_error(&self, hash: i32, message: &str) {
        self.record(format!("error:{hash}:{message}"));
    }

    fn storage_for(&self, hash: i32) -> ModStorage {
        self.storage(hash)
    }

    async fn on_mod_message(&self, hash: i32, data: Value) -> anyhow::Result<Value> {
        self.record(format!("message:{hash}"));
        Ok(json!({"echo": data}))
    }
}

//! Registry test support: WAT mod fixtures and recording collaborators.

mod saver_tests;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::tabs::{TabBridge, TabInfo};

pub(crate) fn escape_wat(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:02x}")).collect()
}

/// Builds a mod source. `extra` splices into the metadata JSON after the
/// version field; `imports` and `body` splice into the module.
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

pub(crate) fn minimal_mod(name: &str) -> String {
    mod_source(name, "", "", "")
}

/// A provider exposing `dependency_name` at the given version.
pub(crate) fn provider_mod(name: &str, dependency_name: &str, version: &str) -> String {
    let metadata = format!(
        r#"{{"abi_version":1,"name":"{name}","description":"test mod","version":"{version}","dependency_name":"{dependency_name}"}}"#
    );
    format!(
        r#"(module
  (memory (export "memory") 1)
  (data (i32.const 1024) "{data}")
  (func (export "mod_metadata_ptr") (result i32) i32.const 1024)
  (func (export "mod_metadata_len") (result i32) i32.const {len}))"#,
        data = escape_wat(metadata.as_bytes()),
        len = metadata.len(),
    )
}

/// A background-capable mod that counts every background event it
/// receives into shared storage under `"events"`.
pub(crate) fn counting_mod(name: &str, extra: &str) -> String {
    mod_source(
        name,
        &format!(r#","flags":["background-script"]{extra}"#),
        r#"  (import "modweave" "storage_set" (func $sset (param i32 i32 i32 i32 i32)))"#,
        r#"  (global $count (mut i32) (i32.const 0))
  (data (i32.const 0) "events")
  (func (export "alloc") (param i32) (result i32) i32.const 8192)
  (func (export "background") (param i32 i32) (result i64)
    (global.set $count (i32.add (global.get $count) (i32.const 1)))
    (i32.store8 (i32.const 16) (i32.add (i32.const 48) (global.get $count)))
    (call $sset (i32.const 0) (i32.const 0) (i32.const 6) (i32.const 16) (i32.const 1))
    (i64.const 0))"#,
    )
}

/// A tab bridge that records every interaction.
#[derive(Debug, Default)]
pub(crate) struct RecordingTabBridge {
    pub tabs: Mutex<Vec<TabInfo>>,
    pub sent: Mutex<Vec<(u64, Value)>>,
    pub cleared: Mutex<Vec<String>>,
}

impl RecordingTabBridge {
    pub fn with_tab(id: u64, origin: &str) -> Arc<Self> {
        let bridge = Self::default();
        bridge.tabs.lock().expect("tabs").push(TabInfo {
            id,
            origin: origin.to_string(),
        });
        Arc::new(bridge)
    }

    pub fn sent_envelopes(&self) -> Vec<(u64, Value)> {
        self.sent.lock().expect("sent").clone()
    }

    pub fn cleared_origins(&self) -> Vec<String> {
        self.cleared.lock().expect("cleared").clone()
    }
}

#[async_trait]
impl TabBridge for Arc<RecordingTabBridge> {
    async fn send_to_tab(&self, tab: u64, envelope: Value) -> anyhow::Result<Value> {
        self.sent.lock().expect("sent").push((tab, envelope));
        Ok(Value::Null)
    }

    async fn query_tabs(&self) -> Vec<TabInfo> {
        self.tabs.lock().expect("tabs").clone()
    }

    async fn clear_origin_cache(&self, origin: &str) {
        self.cleared.lock().expect("cleared").push(origin.to_string());
    }
}

use modweave_api::abi::pack_region;
use modweave_api::{BackgroundContext, BackgroundEvent, ModStorage, StorageScope};
use semver::Version;
use serde_json::{Value, json};

use super::{metadata_json, module_with_metadata};
use crate::compile::{ProviderHandle, TrustedCompiler};
use crate::error::Error;
use crate::validate::Validator;

fn provider(name: &str, version: Version) -> ProviderHandle {
    ProviderHandle {
        dependency_name: name.to_string(),
        version,
        methods: json!({"methods": ["query"]}),
    }
}

fn compile(
    source: &str,
    providers: &[ProviderHandle],
) -> Result<crate::compile::CompiledMod, Error> {
    let descriptor = Validator::new().validate(source.as_bytes())?;
    TrustedCompiler::new().compile(
        source.as_bytes(),
        descriptor,
        ModStorage::default(),
        "controller",
        providers,
    )
}

#[test]
fn missing_provider_aborts_the_compile() {
    let source = module_with_metadata(
        &metadata_json("needy", r#","requirements":["dep-1.0.0"]"#),
        "",
        "",
    );
    let err = compile(&source, &[]).unwrap_err();
    assert!(matches!(err, Error::MissingDependency { .. }), "got {err:?}");
}

#[test]
fn outdated_provider_is_a_version_mismatch() {
    let source = module_with_metadata(
        &metadata_json("needy", r#","requirements":["dep-1.0.0"]"#),
        "",
        "",
    );
    let err = compile(&source, &[provider("dep", Version::new(0, 9, 0))]).unwrap_err();
    assert!(matches!(err, Error::VersionMismatch { .. }), "got {err:?}");
}

#[test]
fn satisfied_requirement_binds_the_provider_methods() {
    let source = module_with_metadata(
        &metadata_json("needy", r#","requirements":["dep-1.0.0"]"#),
        "",
        "",
    );
    let compiled = compile(&source, &[provider("dep", Version::new(1, 4, 0))]).expect("compile");
    assert_eq!(compiled.dependencies.len(), 1);
    assert_eq!(compiled.dependencies[0].name, "dep");
    assert_eq!(compiled.dependencies[0].version, Version::new(1, 4, 0));
    assert_eq!(compiled.dependencies[0].methods["methods"][0], "query");
}

#[test]
fn requests_flag_opens_the_network_surface() {
    let body = r#"  (data (i32.const 0) "https://api.example/data")
  (func (export "on_load") (drop (call $fetch (i32.const 0) (i32.const 24))))"#;
    let imports =
        r#"  (import "modweave" "http_fetch" (func $fetch (param i32 i32) (result i64)))"#;

    let with_flag = module_with_metadata(
        &metadata_json("fetcher", r#","flags":["requests"]"#),
        imports,
        body,
    );
    let mut compiled = compile(&with_flag, &[]).expect("compile");
    compiled.on_load().expect("on_load with requests flag");
    assert_eq!(compiled.resource_snapshot().pending_fetches, 1);

    let without_flag = module_with_metadata(&metadata_json("fetcher", ""), imports, body);
    let mut denied = compile(&without_flag, &[]).expect("compile");
    let err = denied.on_load().unwrap_err();
    assert!(matches!(err, Error::Permission { .. }), "got {err:?}");
}

#[test]
fn storage_accessors_reach_the_bound_storage() {
    let source = module_with_metadata(
        &metadata_json("counter", ""),
        r#"  (import "modweave" "storage_set" (func $sset (param i32 i32 i32 i32 i32)))"#,
        r#"  (data (i32.const 0) "count")
  (data (i32.const 16) "41")
  (func (export "on_load")
    (call $sset (i32.const 0) (i32.const 0) (i32.const 5) (i32.const 16) (i32.const 2)))"#,
    );
    let descriptor = Validator::new().validate(source.as_bytes()).expect("validate");
    let storage = ModStorage::default();
    let mut compiled = TrustedCompiler::new()
        .compile(source.as_bytes(), descriptor, storage.clone(), "controller", &[])
        .expect("compile");
    compiled.on_load().expect("on_load");
    assert_eq!(
        storage.get(StorageScope::Shared, "controller", "count"),
        Some(json!(41))
    );
}

#[test]
fn background_event_round_trips_through_the_guest() {
    let response = r#"{"handled":true}"#;
    let packed = pack_region(512, response.len() as u32);
    let source = module_with_metadata(
        &metadata_json("bg", r#","flags":["background-script"]"#),
        "",
        &format!(
            r#"  (data (i32.const 512) "{data}")
  (func (export "alloc") (param i32) (result i32) i32.const 4096)
  (func (export "background") (param i32 i32) (result i64) i64.const {packed})"#,
            data = super::escape_wat(response.as_bytes()),
        ),
    );
    let mut compiled = compile(&source, &[]).expect("compile");
    let event = BackgroundEvent::Load {
        context: BackgroundContext::default(),
        enabled: vec![],
    };
    let reply = compiled.background(&event).expect("background");
    assert_eq!(reply, Some(json!({"handled": true})));
}

#[test]
fn mods_without_background_ignore_events() {
    let source = super::minimal_mod("quiet");
    let mut compiled = compile(&source, &[]).expect("compile");
    let event = BackgroundEvent::Load {
        context: BackgroundContext::default(),
        enabled: vec![],
    };
    assert_eq!(compiled.background(&event).expect("background"), None);
}

#[test]
fn compiled_destroy_is_a_no_op() {
    let source = super::minimal_mod("alive");
    let mut compiled = compile(&source, &[]).expect("compile");
    compiled.destroy();
    // Running-instance lifetime belongs to the caller; the realm is
    // still usable after destroy().
    compiled.on_load().expect("still alive");
}

#[test]
fn export_methods_default_to_null() {
    let source = super::minimal_mod("plain");
    let mut compiled = compile(&source, &[]).expect("compile");
    assert_eq!(compiled.export_methods().expect("methods"), Value::Null);
}

#[test]
fn exported_methods_surface_to_the_host() {
    let methods = r#"{"methods":["transform","peek"]}"#;
    let source = module_with_metadata(
        &metadata_json("provider", r#","dependency_name":"provider""#),
        "",
        &format!(
            r#"  (data (i32.const 600) "{data}")
  (func (export "export_methods_ptr") (result i32) i32.const 600)
  (func (export "export_methods_len") (result i32) i32.const {len})"#,
            data = super::escape_wat(methods.as_bytes()),
            len = methods.len(),
        ),
    );
    let mut compiled = compile(&source, &[]).expect("compile");
    let value = compiled.export_methods().expect("methods");
    assert_eq!(value["methods"][1], "peek");
}

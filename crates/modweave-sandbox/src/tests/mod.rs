//! Shared WAT fixtures for the sandbox tests. Test mods are hand-written
//! text modules: small enough to read, real enough to exercise the whole
//! host surface.

mod compile_tests;
mod realm_tests;
mod validate_tests;

/// Escapes bytes for a WAT data-segment string literal.
pub(crate) fn escape_wat(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:02x}")).collect()
}

/// Minimal valid metadata document. `extra` is spliced after the version
/// field, e.g. `,"flags":["requests"]`.
pub(crate) fn metadata_json(name: &str, extra: &str) -> String {
    format!(
        r#"{{"abi_version":1,"name":"{name}","description":"test mod","version":"1.0.0"{extra}}}"#
    )
}

/// A module exporting the given metadata document plus optional extra
/// imports and body fields. Imports must stay ahead of definitions, so
/// they splice in first.
pub(crate) fn module_with_metadata(metadata: &str, imports: &str, body: &str) -> String {
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

/// The smallest installable mod.
pub(crate) fn minimal_mod(name: &str) -> String {
    module_with_metadata(&metadata_json(name, ""), "", "")
}

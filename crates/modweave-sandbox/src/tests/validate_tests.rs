use modweave_api::{ModFlag, content_hash};

use super::{metadata_json, minimal_mod, module_with_metadata};
use crate::error::Error;
use crate::validate::Validator;

#[test]
fn valid_source_yields_a_descriptor_and_a_stable_hash() {
    let source = minimal_mod("greeter");
    let validator = Validator::new();
    let first = validator.validate(source.as_bytes()).expect("validate");
    let second = validator.validate(source.as_bytes()).expect("validate");

    assert_eq!(first.name, "greeter");
    assert_eq!(first.description, "test mod");
    assert_eq!(first.version.to_string(), "1.0.0");
    assert_eq!(first.hash, second.hash);
    assert_eq!(first.hash, content_hash(source.as_bytes()));
}

#[test]
fn missing_metadata_exports_fail_as_invalid_mod() {
    let err = Validator::new()
        .validate(br#"(module (memory (export "memory") 1))"#)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMod { .. }), "got {err:?}");
}

#[test]
fn non_compiling_source_fails_as_invalid_mod() {
    let err = Validator::new().validate(b"(module (oops)").unwrap_err();
    assert!(matches!(err, Error::InvalidMod { .. }));
}

#[test]
fn invalid_semver_fails_validation() {
    let metadata =
        r#"{"abi_version":1,"name":"x","description":"d","version":"one.two.three"}"#;
    let source = module_with_metadata(metadata, "", "");
    let err = Validator::new().validate(source.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }), "got {err:?}");
}

#[test]
fn empty_name_fails_validation() {
    let metadata = r#"{"abi_version":1,"name":"","description":"d","version":"1.0.0"}"#;
    let source = module_with_metadata(metadata, "", "");
    let err = Validator::new().validate(source.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
}

#[test]
fn missing_description_fails_validation() {
    let metadata = r#"{"abi_version":1,"name":"x","version":"1.0.0"}"#;
    let source = module_with_metadata(metadata, "", "");
    let err = Validator::new().validate(source.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
}

#[test]
fn malformed_requirement_fails_validation() {
    let source = module_with_metadata(
        &metadata_json("needy", r#","requirements":["dep_without_version"]"#),
        "",
        "",
    );
    let err = Validator::new().validate(source.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
}

#[test]
fn requirement_strings_split_at_the_first_dash() {
    let source = module_with_metadata(
        &metadata_json("needy", r#","requirements":["dep-1.2.0"]"#),
        "",
        "",
    );
    let descriptor = Validator::new().validate(source.as_bytes()).expect("validate");
    assert_eq!(descriptor.requirements.len(), 1);
    assert_eq!(descriptor.requirements[0].dependency_name, "dep");
    assert_eq!(descriptor.requirements[0].min_version.to_string(), "1.2.0");
}

#[test]
fn background_flag_requires_the_background_export() {
    let source = module_with_metadata(
        &metadata_json("bg", r#","flags":["background-script"]"#),
        "",
        "",
    );
    let err = Validator::new().validate(source.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::InvalidMod { .. }));

    let with_export = module_with_metadata(
        &metadata_json("bg", r#","flags":["background-script"]"#),
        "",
        r#"  (func (export "alloc") (param i32) (result i32) i32.const 4096)
  (func (export "background") (param i32 i32) (result i64) i64.const 0)"#,
    );
    let descriptor = Validator::new()
        .validate(with_export.as_bytes())
        .expect("validate");
    assert!(descriptor.has_flag(ModFlag::BackgroundScript));
}

#[test]
fn declared_flags_and_origins_survive_validation() {
    let source = module_with_metadata(
        &metadata_json(
            "scoped",
            r#","flags":["requests"],"origins":["example.com"],"dependency_name":"scoped","priority":7"#,
        ),
        "",
        "",
    );
    let descriptor = Validator::new().validate(source.as_bytes()).expect("validate");
    assert!(descriptor.has_flag(ModFlag::Requests));
    assert!(descriptor.allows_origin("https://example.com"));
    assert!(!descriptor.allows_origin("https://other.com"));
    assert_eq!(descriptor.dependency_name.as_deref(), Some("scoped"));
    assert_eq!(descriptor.priority, 7);
}

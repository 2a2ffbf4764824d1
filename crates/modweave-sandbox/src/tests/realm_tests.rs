use wasmtime::Engine;

use super::{metadata_json, module_with_metadata};
use crate::error::Error;
use crate::realm::{Realm, RealmState};

fn run(source: &str) -> Result<Realm, Error> {
    Realm::run(&Engine::default(), source.as_bytes(), RealmState::validation())
}

#[test]
fn start_time_registrations_are_reclaimed_on_destroy() {
    let source = module_with_metadata(
        &metadata_json("timer-mod", ""),
        r#"  (import "modweave" "timeout_start" (func $timeout (param i64) (result i64)))
  (import "modweave" "listener_add" (func $listen (param i32 i32) (result i64)))"#,
        r#"  (data (i32.const 0) "scroll")
  (func $init
    (drop (call $timeout (i64.const 250)))
    (drop (call $listen (i32.const 0) (i32.const 6))))
  (start $init)"#,
    );
    let mut realm = run(&source).expect("instantiate");
    let live = realm.resource_snapshot();
    assert_eq!(live.active_timeouts, 1);
    assert_eq!(live.active_listeners, 1);

    let report = realm.destroy();
    assert_eq!(report.cancelled_timeouts, 1);
    assert_eq!(report.removed_listeners, 1);
    assert!(realm.resource_snapshot().is_empty());
}

#[test]
fn destroy_twice_is_a_no_op_the_second_time() {
    let source = module_with_metadata(
        &metadata_json("idempotent-mod", ""),
        r#"  (import "modweave" "frame_request" (func $frame (result i64)))"#,
        r#"  (func $init (drop (call $frame)))
  (start $init)"#,
    );
    let mut realm = run(&source).expect("instantiate");
    let first = realm.destroy();
    assert_eq!(first.cancelled_frames, 1);
    // Nothing is cancelled twice; the same report comes back.
    let second = realm.destroy();
    assert_eq!(second, first);
    assert!(realm.is_destroyed());
}

#[test]
fn network_denies_while_capabilities_are_unknown() {
    let source = module_with_metadata(
        &metadata_json("fetcher-mod", r#","flags":["requests"]"#),
        r#"  (import "modweave" "http_fetch" (func $fetch (param i32 i32) (result i64)))"#,
        r#"  (data (i32.const 0) "https://api.example/data")
  (func $init (drop (call $fetch (i32.const 0) (i32.const 24))))
  (start $init)"#,
    );
    // The fetch happens during instantiation, before any flags could
    // have been granted; the declared flag does not help.
    let err = run(&source).unwrap_err();
    assert!(matches!(err, Error::Permission { .. }), "got {err:?}");
}

#[test]
fn privileged_surface_always_denies() {
    let source = module_with_metadata(
        &metadata_json("snoop-mod", ""),
        r#"  (import "privileged" "tabs_query" (func $tabs (result i64)))"#,
        r#"  (func $init (drop (call $tabs)))
  (start $init)"#,
    );
    let err = run(&source).unwrap_err();
    assert!(matches!(err, Error::Permission { .. }), "got {err:?}");
}

#[test]
fn missing_metadata_exports_is_an_invalid_mod() {
    let mut realm = run(r#"(module (memory (export "memory") 1))"#).expect("instantiate");
    let err = realm.metadata_json().unwrap_err();
    assert!(matches!(err, Error::InvalidMod { .. }));
}

#[test]
fn calls_after_destroy_fail_with_destroyed() {
    let source = super::minimal_mod("gone-mod");
    let mut realm = run(&source).expect("instantiate");
    realm.destroy();
    let err = realm.metadata_json().unwrap_err();
    assert!(matches!(err, Error::Destroyed));
}

#[test]
fn cancelled_registrations_leave_the_ledger() {
    let source = module_with_metadata(
        &metadata_json("tidy-mod", ""),
        r#"  (import "modweave" "interval_start" (func $interval (param i64) (result i64)))
  (import "modweave" "interval_cancel" (func $cancel (param i64)))"#,
        r#"  (func $init (call $cancel (call $interval (i64.const 50))))
  (start $init)"#,
    );
    let mut realm = run(&source).expect("instantiate");
    assert!(realm.resource_snapshot().is_empty());
    assert_eq!(realm.destroy().cancelled_intervals, 0);
}

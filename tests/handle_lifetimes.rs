//! Host records are freed once the last reference to them goes away.

mod common;

use common::{guest, instantiate_with, offline};
use hostbind::config::StaticRoute;
use hostbind::net::{RecordCounts, StaticBackend};
use hostbind::{Bridge, BridgeConfig};

const IMPORTS: &str = r#"
  (import "hostbind" "object_new" (func $object_new (result i32)))
  (import "hostbind" "object_drop_ref" (func $drop (param i32)))
  (import "hostbind" "object_clone_ref" (func $clone (param i32) (result i32)))
  (import "hostbind" "object_set" (func $object_set (param i32 i32 i32 i32)))
  (import "hostbind" "string_new" (func $string_new (param i32 i32) (result i32)))
  (import "hostbind" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
  (import "hostbind" "headers_new" (func $headers_new (result i32)))
  (import "hostbind" "headers_append" (func $headers_append (param i32 i32 i32 i32 i32)))
  (import "hostbind" "request_new" (func $request_new (param i32 i32 i32 i32 i32 i32) (result i32)))
  (import "hostbind" "fetch" (func $fetch (param i32 i32) (result i32)))
  (import "hostbind" "response_headers" (func $response_headers (param i32) (result i32)))
  (import "hostbind" "body" (func $body (result i32)))
  (import "hostbind" "create_element" (func $create_element (param i32 i32) (result i32)))
  (import "hostbind" "set_inner_html" (func $set_inner_html (param i32 i32 i32)))
"#;

const BODY: &str = r#"
  (data (i32.const 16) "key")
  (data (i32.const 32) "accept")
  (data (i32.const 48) "https://example.test/data")
  (data (i32.const 80) "div")
  (data (i32.const 96) "<p><b>x</b></p>")

  (table (export "__indirect_function_table") 3 funcref)
  (elem (i32.const 1) $on_settle $destroy)

  ;; Looks at the response's headers, then lets go of both.
  (func $on_settle (param $code i32) (param $env i32) (param $arg i32)
    (local $headers i32)
    (local.set $headers (call $response_headers (local.get $arg)))
    (call $drop (local.get $arg))
    (call $drop (local.get $headers)))
  (func $destroy (param $code i32) (param $env i32))

  (func (export "__hb_start"))

  (func (export "churn_objects") (param $n i32)
    (block $done
      (loop $next
        (br_if $done (i32.eqz (local.get $n)))
        (call $drop (call $object_new))
        (local.set $n (i32.sub (local.get $n) (i32.const 1)))
        (br $next))))

  (func (export "churn_headers") (param $n i32)
    (local $h i32)
    (block $done
      (loop $next
        (br_if $done (i32.eqz (local.get $n)))
        (local.set $h (call $headers_new))
        (call $headers_append (local.get $h) (i32.const 32) (i32.const 6) (i32.const 16) (i32.const 3))
        (call $drop (local.get $h))
        (local.set $n (i32.sub (local.get $n) (i32.const 1)))
        (br $next))))

  (func (export "churn_nodes") (param $n i32)
    (block $done
      (loop $next
        (br_if $done (i32.eqz (local.get $n)))
        (call $drop (call $create_element (i32.const 80) (i32.const 3)))
        (local.set $n (i32.sub (local.get $n) (i32.const 1)))
        (br $next))))

  ;; An object holding another object that the guest has let go of.
  (func (export "nested") (result i32)
    (local $outer i32) (local $inner i32)
    (local.set $outer (call $object_new))
    (local.set $inner (call $object_new))
    (call $object_set (local.get $outer) (i32.const 16) (i32.const 3) (local.get $inner))
    (call $drop (local.get $inner))
    (local.get $outer))
  (func (export "overwrite") (param $outer i32)
    (local $s i32)
    (local.set $s (call $string_new (i32.const 16) (i32.const 3)))
    (call $object_set (local.get $outer) (i32.const 16) (i32.const 3) (local.get $s))
    (call $drop (local.get $s)))
  (func (export "clone") (param $h i32) (result i32)
    (call $clone (local.get $h)))
  (func (export "drop") (param $h i32)
    (call $drop (local.get $h)))

  (func (export "fetch_and_forget")
    (local $request i32)
    (local.set $request
      (call $request_new (i32.const 48) (i32.const 25) (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0)))
    (call $drop
      (call $fetch (local.get $request)
        (call $closure_new (i32.const 0) (i32.const 0) (i32.const 2) (i32.const 1))))
    (call $drop (local.get $request)))

  (func (export "replace_body")
    (local $body i32)
    (local.set $body (call $body))
    (call $set_inner_html (local.get $body) (i32.const 96) (i32.const 15))
    (call $set_inner_html (local.get $body) (i32.const 96) (i32.const 15))
    (call $drop (local.get $body)))
"#;

fn bridge() -> Bridge {
    let http = StaticBackend::new([StaticRoute {
        url: "https://example.test/data".into(),
        status: 200,
        body: "payload".into(),
        content_type: "text/plain".into(),
    }]);
    let mut bridge = instantiate_with(
        &guest(IMPORTS, BODY),
        BridgeConfig::default(),
        offline().with_http(http),
    );
    bridge.start().expect("start");
    bridge
}

#[test]
fn test_dropped_objects_leave_the_arena() {
    let mut bridge = bridge();
    bridge.call::<i32, ()>("churn_objects", 10_000).expect("churn");
    assert!(bridge.state().objects.is_empty());
    assert_eq!(bridge.state().table.live_count(), 0);
}

#[test]
fn test_objects_live_while_any_handle_or_property_holds_them() {
    let mut bridge = bridge();
    let outer: i32 = bridge.call("nested", ()).expect("nested");
    assert_eq!(bridge.state().objects.len(), 2, "the property keeps the inner object");

    bridge.call::<i32, ()>("overwrite", outer).expect("overwrite");
    assert_eq!(bridge.state().objects.len(), 1, "replacing the property frees it");

    let copy: i32 = bridge.call("clone", outer).expect("clone");
    bridge.call::<i32, ()>("drop", outer).expect("drop");
    assert_eq!(bridge.state().objects.len(), 1, "the clone still holds it");
    bridge.call::<i32, ()>("drop", copy).expect("drop");
    assert!(bridge.state().objects.is_empty());
}

#[test]
fn test_dropped_header_lists_are_freed() {
    let mut bridge = bridge();
    bridge.call::<i32, ()>("churn_headers", 1_000).expect("churn");
    assert_eq!(bridge.state().network.record_counts(), RecordCounts::default());
}

#[test]
fn test_forgotten_fetch_is_freed_after_it_settles() {
    let mut bridge = bridge();
    bridge.call::<(), ()>("fetch_and_forget", ()).expect("fetch");
    let queued = bridge.state().network.record_counts();
    assert_eq!(queued.requests, 1, "the queued fetch still needs its request");
    assert_eq!(queued.fetches, 1);

    bridge.run_until_idle(10).expect("settle");
    assert_eq!(bridge.state().network.record_counts(), RecordCounts::default());
}

#[test]
fn test_detached_and_replaced_nodes_are_freed() {
    let mut bridge = bridge();
    let skeleton = bridge.state().document.node_count();

    bridge.call::<i32, ()>("churn_nodes", 1_000).expect("churn");
    assert_eq!(bridge.state().document.node_count(), skeleton);

    bridge.call::<(), ()>("replace_body", ()).expect("replace");
    // p, b and the text node from the second assignment only.
    assert_eq!(bridge.state().document.node_count(), skeleton + 3);
}

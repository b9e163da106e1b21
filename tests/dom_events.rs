//! Document building, selector queries and event dispatch from a WAT guest.

mod common;

use common::{counter, guest, read_string, started, OUT};
use hostbind::{Handle, HostValue};

const IMPORTS: &str = r#"
  (import "hostbind" "document" (func $document (result i32)))
  (import "hostbind" "body" (func $body (result i32)))
  (import "hostbind" "create_element" (func $create_element (param i32 i32) (result i32)))
  (import "hostbind" "set_attribute" (func $set_attribute (param i32 i32 i32 i32 i32)))
  (import "hostbind" "set_text_content" (func $set_text (param i32 i32 i32)))
  (import "hostbind" "append_child" (func $append (param i32 i32)))
  (import "hostbind" "query_selector" (func $query (param i32 i32 i32) (result i32)))
  (import "hostbind" "text_content" (func $text_content (param i32 i32) (result i32)))
  (import "hostbind" "error_pending" (func $error_pending (result i32)))
  (import "hostbind" "take_error" (func $take_error (result i32)))
  (import "hostbind" "error_name" (func $error_name (param i32 i32)))
  (import "hostbind" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
  (import "hostbind" "closure_drop" (func $closure_drop (param i32) (result i32)))
  (import "hostbind" "add_event_listener" (func $listen (param i32 i32 i32 i32)))
  (import "hostbind" "event_type" (func $event_type (param i32 i32)))
  (import "hostbind" "prevent_default" (func $prevent (param i32)))
"#;

const BODY: &str = r##"
  (data (i32.const 16) "div")
  (data (i32.const 32) "id")
  (data (i32.const 48) "main")
  (data (i32.const 64) "hello")
  (data (i32.const 80) "#main")
  (data (i32.const 96) "click")
  (data (i32.const 112) "[x")

  (global $clicks (mut i32) (i32.const 0))
  (global $last_env (mut i32) (i32.const 0))
  (global $destroyed (mut i32) (i32.const 0))

  (table (export "__indirect_function_table") 3 funcref)
  (elem (i32.const 1) $on_click $destroy)

  (func $on_click (param $code i32) (param $env i32) (param $ev i32)
    (global.set $clicks (i32.add (global.get $clicks) (i32.const 1)))
    (global.set $last_env (local.get $env))
    (call $event_type (i32.const 2048) (local.get $ev))
    (call $prevent (local.get $ev)))
  (func $destroy (param $code i32) (param $env i32)
    (global.set $destroyed (i32.add (global.get $destroyed) (i32.const 1))))

  (func (export "__hb_start"))

  (func (export "build") (result i32)
    (local $el i32)
    (local.set $el (call $create_element (i32.const 16) (i32.const 3)))
    (call $set_attribute (local.get $el) (i32.const 32) (i32.const 2) (i32.const 48) (i32.const 4))
    (call $set_text (local.get $el) (i32.const 64) (i32.const 5))
    (call $append (call $body) (local.get $el))
    (local.get $el))
  (func (export "find") (result i32)
    (call $query (call $document) (i32.const 80) (i32.const 5)))
  (func (export "read_text") (param $h i32) (result i32)
    (call $text_content (i32.const 1024) (local.get $h)))
  (func (export "bad_query") (result i32)
    (call $query (call $document) (i32.const 112) (i32.const 2)))
  (func (export "collect_error_name") (result i32)
    (local $err i32)
    (if (i32.eqz (call $error_pending)) (then (return (i32.const 0))))
    (local.set $err (call $take_error))
    (call $error_name (i32.const 1024) (local.get $err))
    (local.get $err))
  (func (export "listen") (param $el i32) (result i32)
    (local $c i32)
    (local.set $c (call $closure_new (i32.const 7) (i32.const 200) (i32.const 2) (i32.const 1)))
    (call $listen (local.get $el) (i32.const 96) (i32.const 5) (local.get $c))
    (local.get $c))
  (func (export "unlisten") (param $c i32) (result i32)
    (call $closure_drop (local.get $c)))

  (func (export "clicks") (result i32) (global.get $clicks))
  (func (export "last_env") (result i32) (global.get $last_env))
  (func (export "destroyed") (result i32) (global.get $destroyed))
"##;

fn bridge() -> hostbind::Bridge {
    started(&guest(IMPORTS, BODY))
}

#[test]
fn test_build_and_query_document() {
    let mut bridge = bridge();

    let el: i32 = bridge.call("build", ()).expect("build");
    let built = match bridge.value(Handle::from_abi(el)).expect("live handle") {
        HostValue::Node(id) => *id,
        other => panic!("expected a node, got {other:?}"),
    };

    let state = bridge.state();
    let html = state
        .document
        .outer_html(state.document.body())
        .expect("serialize body");
    assert_eq!(html, r#"<body><div id="main">hello</div></body>"#);

    let found: i32 = bridge.call("find", ()).expect("find");
    assert_ne!(found, 0);
    assert_eq!(
        bridge.value(Handle::from_abi(found)).expect("live handle"),
        &HostValue::Node(built)
    );

    let present: i32 = bridge.call("read_text", el).expect("text_content");
    assert_eq!(present, 1);
    assert_eq!(read_string(&mut bridge, OUT), "hello");
}

#[test]
fn test_malformed_selector_sets_pending_error() {
    let mut bridge = bridge();

    let found: i32 = bridge.call("bad_query", ()).expect("query returns a sentinel");
    assert_eq!(found, 0);
    assert!(bridge.state().pending.is_pending());

    let err: i32 = bridge.call("collect_error_name", ()).expect("collect");
    assert_ne!(err, 0);
    assert!(!bridge.state().pending.is_pending());
    assert_eq!(read_string(&mut bridge, OUT), "SyntaxError");
    assert!(bridge.state().poisoned().is_none());
}

#[test]
fn test_listener_prevents_default_and_is_destroyed_once() {
    let mut bridge = bridge();
    let el: i32 = bridge.call("build", ()).expect("build");
    let closure: i32 = bridge.call("listen", el).expect("listen");

    let proceed = bridge
        .dispatch_event(Handle::from_abi(el), "click")
        .expect("dispatch");
    assert!(!proceed, "listener called prevent_default");
    assert_eq!(counter(&mut bridge, "clicks"), 1);
    assert_eq!(counter(&mut bridge, "last_env"), 200);
    assert_eq!(read_string(&mut bridge, 2048), "click");
    assert!(bridge.state().events.is_empty());

    let destroyed: i32 = bridge.call("unlisten", closure).expect("drop closure");
    assert_eq!(destroyed, 1);
    assert_eq!(counter(&mut bridge, "destroyed"), 1);

    // The listener is still registered but its closure is inert.
    let proceed = bridge
        .dispatch_event(Handle::from_abi(el), "click")
        .expect("dispatch");
    assert!(proceed);
    assert_eq!(counter(&mut bridge, "clicks"), 1);
    assert_eq!(counter(&mut bridge, "destroyed"), 1);
}

#[test]
fn test_unknown_event_type_has_no_listeners() {
    let mut bridge = bridge();
    let el: i32 = bridge.call("build", ()).expect("build");
    bridge.call::<i32, i32>("listen", el).expect("listen");

    let proceed = bridge
        .dispatch_event(Handle::from_abi(el), "keydown")
        .expect("dispatch");
    assert!(proceed);
    assert_eq!(counter(&mut bridge, "clicks"), 0);
}

const TREE_IMPORTS: &str = r#"
  (import "hostbind" "document" (func $document (result i32)))
  (import "hostbind" "body" (func $body (result i32)))
  (import "hostbind" "create_element" (func $create_element (param i32 i32) (result i32)))
  (import "hostbind" "append_child" (func $append (param i32 i32)))
  (import "hostbind" "set_inner_html" (func $set_inner_html (param i32 i32 i32)))
  (import "hostbind" "get_element_by_id" (func $by_id (param i32 i32) (result i32)))
  (import "hostbind" "query_selector" (func $query (param i32 i32 i32) (result i32)))
  (import "hostbind" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
  (import "hostbind" "add_event_listener" (func $listen (param i32 i32 i32 i32)))
  (import "hostbind" "event_target" (func $event_target (param i32) (result i32)))
  (import "hostbind" "event_current_target" (func $current_target (param i32) (result i32)))
  (import "hostbind" "event_path_len" (func $path_len (param i32) (result i32)))
  (import "hostbind" "stop_propagation" (func $stop_propagation (param i32)))
"#;

const TREE_BODY: &str = r#"
  (data (i32.const 16) "div")
  (data (i32.const 32) "click")
  (data (i32.const 48) "<span id=\"x\">hi</span>")
  (data (i32.const 96) "x")
  (data (i32.const 112) "span")

  (global $body_hits (mut i32) (i32.const 0))
  (global $div_hits (mut i32) (i32.const 0))
  (global $current (mut i32) (i32.const 0))
  (global $target (mut i32) (i32.const 0))
  (global $path (mut i32) (i32.const 0))
  (global $stop (mut i32) (i32.const 0))

  (table (export "__indirect_function_table") 3 funcref)
  (elem (i32.const 1) $on_click $destroy)

  ;; Code 1 listens on body, code 2 on the div.
  (func $on_click (param $code i32) (param $env i32) (param $ev i32)
    (if (i32.eq (local.get $code) (i32.const 1))
      (then
        (global.set $body_hits (i32.add (global.get $body_hits) (i32.const 1)))
        (global.set $current (call $current_target (local.get $ev)))
        (global.set $target (call $event_target (local.get $ev)))
        (global.set $path (call $path_len (local.get $ev))))
      (else
        (global.set $div_hits (i32.add (global.get $div_hits) (i32.const 1)))
        (if (global.get $stop) (then (call $stop_propagation (local.get $ev)))))))
  (func $destroy (param $code i32) (param $env i32))

  (func (export "__hb_start"))

  (func (export "setup") (result i32)
    (local $div i32)
    (local.set $div (call $create_element (i32.const 16) (i32.const 3)))
    (call $append (call $body) (local.get $div))
    (call $listen (call $body) (i32.const 32) (i32.const 5)
      (call $closure_new (i32.const 1) (i32.const 0) (i32.const 2) (i32.const 1)))
    (call $listen (local.get $div) (i32.const 32) (i32.const 5)
      (call $closure_new (i32.const 2) (i32.const 0) (i32.const 2) (i32.const 1)))
    (local.get $div))
  (func (export "set_stop") (param i32) (global.set $stop (local.get 0)))
  (func (export "load_markup") (result i32)
    (call $set_inner_html (call $body) (i32.const 48) (i32.const 22))
    (call $by_id (i32.const 96) (i32.const 1)))
  (func (export "find_span") (result i32)
    (call $query (call $document) (i32.const 112) (i32.const 4)))

  (func (export "body_hits") (result i32) (global.get $body_hits))
  (func (export "div_hits") (result i32) (global.get $div_hits))
  (func (export "current") (result i32) (global.get $current))
  (func (export "target") (result i32) (global.get $target))
  (func (export "path") (result i32) (global.get $path))
"#;

fn tree_bridge() -> hostbind::Bridge {
    started(&guest(TREE_IMPORTS, TREE_BODY))
}

#[test]
fn test_click_on_child_bubbles_to_body_listener() {
    let mut bridge = tree_bridge();
    let div: i32 = bridge.call("setup", ()).expect("setup");
    let div_node = bridge.value(Handle::from_abi(div)).expect("div").clone();

    let proceed = bridge
        .dispatch_event(Handle::from_abi(div), "click")
        .expect("dispatch");
    assert!(proceed);
    assert_eq!(counter(&mut bridge, "div_hits"), 1);
    assert_eq!(counter(&mut bridge, "body_hits"), 1);

    let body = bridge.state().document.body();
    let current: i32 = counter(&mut bridge, "current");
    assert_eq!(bridge.value(Handle::from_abi(current)).expect("current"), &HostValue::Node(body));
    let target: i32 = counter(&mut bridge, "target");
    assert_eq!(bridge.value(Handle::from_abi(target)).expect("target"), &div_node);
    // div, body, html, document
    assert_eq!(counter(&mut bridge, "path"), 4);
    assert!(bridge.state().events.is_empty());
}

#[test]
fn test_stop_propagation_keeps_event_off_ancestors() {
    let mut bridge = tree_bridge();
    let div: i32 = bridge.call("setup", ()).expect("setup");
    bridge.call::<i32, ()>("set_stop", 1).expect("set_stop");

    bridge
        .dispatch_event(Handle::from_abi(div), "click")
        .expect("dispatch");
    assert_eq!(counter(&mut bridge, "div_hits"), 1);
    assert_eq!(counter(&mut bridge, "body_hits"), 0);

    // Dispatching at body itself still reaches its own listener.
    let body_node = bridge.state().document.body();
    let body = bridge.alloc_value(HostValue::Node(body_node));
    bridge.dispatch_event(body, "click").expect("dispatch");
    assert_eq!(counter(&mut bridge, "body_hits"), 1);
}

#[test]
fn test_inner_html_nodes_are_queryable() {
    let mut bridge = tree_bridge();
    let by_id: i32 = bridge.call("load_markup", ()).expect("load markup");
    assert_ne!(by_id, 0, "get_element_by_id finds the parsed span");
    let by_selector: i32 = bridge.call("find_span", ()).expect("query");
    assert_ne!(by_selector, 0);

    let span = match bridge.value(Handle::from_abi(by_id)).expect("span") {
        HostValue::Node(id) => *id,
        other => panic!("expected a node, got {other:?}"),
    };
    assert_eq!(
        bridge.value(Handle::from_abi(by_selector)).expect("span"),
        &HostValue::Node(span)
    );
    let state = bridge.state();
    assert_eq!(state.document.parent(span).expect("parent"), Some(state.document.body()));
    assert_eq!(state.document.text_content(span).expect("text").as_deref(), Some("hi"));
    assert_eq!(
        state.document.outer_html(state.document.body()).expect("html"),
        r#"<body><span id="x">hi</span></body>"#
    );
}

//! Closure lifetimes and timer delivery through the event loop.

mod common;

use common::{counter, guest, started};
use hostbind::HostValue;

const IMPORTS: &str = r#"
  (import "hostbind" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
  (import "hostbind" "closure_drop" (func $closure_drop (param i32) (result i32)))
  (import "hostbind" "set_timeout" (func $set_timeout (param i32 i32) (result i32)))
  (import "hostbind" "clear_timeout" (func $clear_timeout (param i32)))
  (import "hostbind" "is_undefined" (func $is_undefined (param i32) (result i32)))
"#;

const BODY: &str = r#"
  (global $ticks (mut i32) (i32.const 0))
  (global $last_env (mut i32) (i32.const 0))
  (global $arg_undefined (mut i32) (i32.const 0))
  (global $destroyed (mut i32) (i32.const 0))
  (global $self (mut i32) (i32.const 0))

  (table (export "__indirect_function_table") 4 funcref)
  (elem (i32.const 1) $tick $destroy $self_drop)

  (func $tick (param $code i32) (param $env i32) (param $arg i32)
    (global.set $ticks (i32.add (global.get $ticks) (i32.const 1)))
    (global.set $last_env (local.get $env))
    (global.set $arg_undefined (call $is_undefined (local.get $arg))))
  (func $destroy (param $code i32) (param $env i32)
    (global.set $destroyed (i32.add (global.get $destroyed) (i32.const 1))))
  (func $self_drop (param $code i32) (param $env i32) (param $arg i32)
    (drop (call $closure_drop (global.get $self)))
    (global.set $ticks (i32.add (global.get $ticks) (i32.const 1))))

  (func (export "__hb_start"))

  (func (export "make") (param $env i32) (result i32)
    (call $closure_new (i32.const 0) (local.get $env) (i32.const 2) (i32.const 1)))
  (func (export "make_self_dropping") (result i32)
    (global.set $self (call $closure_new (i32.const 0) (i32.const 0) (i32.const 2) (i32.const 3)))
    (global.get $self))
  ;; Table entry 2 is a destructor, entry 1 an invoke entry.
  (func (export "make_mistyped") (result i32)
    (call $closure_new (i32.const 0) (i32.const 0) (i32.const 2) (i32.const 2)))
  (func (export "make_bad_destructor") (result i32)
    (call $closure_new (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 1)))
  (func (export "schedule") (param $c i32) (param $ms i32) (result i32)
    (call $set_timeout (local.get $c) (local.get $ms)))
  (func (export "cancel") (param $t i32)
    (call $clear_timeout (local.get $t)))
  (func (export "release") (param $c i32) (result i32)
    (call $closure_drop (local.get $c)))

  (func (export "ticks") (result i32) (global.get $ticks))
  (func (export "last_env") (result i32) (global.get $last_env))
  (func (export "arg_undefined") (result i32) (global.get $arg_undefined))
  (func (export "destroyed") (result i32) (global.get $destroyed))
"#;

fn bridge() -> hostbind::Bridge {
    started(&guest(IMPORTS, BODY))
}

#[test]
fn test_timers_fire_in_deadline_order_with_undefined_argument() {
    let mut bridge = bridge();
    let closure: i32 = bridge.call("make", 77).expect("make");
    bridge.call::<(i32, i32), i32>("schedule", (closure, 10)).expect("schedule");
    bridge.call::<(i32, i32), i32>("schedule", (closure, 5)).expect("schedule");

    let turns = bridge.run_until_idle(usize::MAX).expect("event loop");
    assert_eq!(turns, 2);
    assert_eq!(counter(&mut bridge, "ticks"), 2);
    assert_eq!(counter(&mut bridge, "last_env"), 77);
    assert_eq!(counter(&mut bridge, "arg_undefined"), 1);
    assert!((bridge.state().timers.now_ms() - 10.0).abs() < 1e-9);

    // Invocations leave the guest's own reference in place.
    assert_eq!(counter(&mut bridge, "destroyed"), 0);
    assert_eq!(bridge.call::<i32, i32>("release", closure).expect("release"), 1);
    assert_eq!(counter(&mut bridge, "destroyed"), 1);
}

#[test]
fn test_cleared_timer_never_fires() {
    let mut bridge = bridge();
    let closure: i32 = bridge.call("make", 1).expect("make");
    let timer: i32 = bridge.call("schedule", (closure, 0)).expect("schedule");
    bridge.call::<i32, ()>("cancel", timer).expect("cancel");

    assert_eq!(bridge.run_until_idle(usize::MAX).expect("event loop"), 0);
    assert_eq!(counter(&mut bridge, "ticks"), 0);
}

#[test]
fn test_released_closure_is_skipped_and_destroyed_once() {
    let mut bridge = bridge();
    let closure: i32 = bridge.call("make", 1).expect("make");
    bridge.call::<(i32, i32), i32>("schedule", (closure, 0)).expect("schedule");
    assert_eq!(bridge.call::<i32, i32>("release", closure).expect("release"), 1);

    bridge.run_until_idle(usize::MAX).expect("event loop");
    assert_eq!(counter(&mut bridge, "ticks"), 0);
    assert_eq!(counter(&mut bridge, "destroyed"), 1);
    assert_eq!(bridge.state().closures.destroyed_count(), 1);
}

#[test]
fn test_closure_released_during_its_own_call_is_destroyed_after_return() {
    let mut bridge = bridge();
    let closure: i32 = bridge.call("make_self_dropping", ()).expect("make");
    let arg = bridge.alloc_value(HostValue::Undefined);

    bridge
        .invoke_closure(hostbind::Handle::from_abi(closure), arg)
        .expect("invoke");
    assert_eq!(counter(&mut bridge, "ticks"), 1);
    assert_eq!(counter(&mut bridge, "destroyed"), 1);
    assert_eq!(bridge.state().closures.live_count(), 0);
}

#[test]
fn test_turn_limit_leaves_remaining_tasks_queued() {
    let mut bridge = bridge();
    let closure: i32 = bridge.call("make", 1).expect("make");
    for delay in [1, 2, 3] {
        bridge.call::<(i32, i32), i32>("schedule", (closure, delay)).expect("schedule");
    }

    assert_eq!(bridge.run_until_idle(1).expect("first turn"), 1);
    assert_eq!(counter(&mut bridge, "ticks"), 1);
    assert_eq!(bridge.run_until_idle(usize::MAX).expect("rest"), 2);
    assert_eq!(counter(&mut bridge, "ticks"), 3);
}

#[test]
fn test_invoke_entry_must_have_the_invoke_signature() {
    let mut bridge = bridge();
    let closure: i32 = bridge.call("make_mistyped", ()).expect("make");
    let arg = bridge.alloc_value(HostValue::Undefined);

    let err = bridge
        .invoke_closure(hostbind::Handle::from_abi(closure), arg)
        .expect_err("entry 2 takes two parameters");
    let message = err.to_string();
    assert!(message.contains("should be (i32, i32, i32) -> ()"), "{message}");
    assert!(message.contains("found (i32, i32) -> ()"), "{message}");
}

#[test]
fn test_destructor_entry_must_have_the_destructor_signature() {
    let mut bridge = bridge();
    let closure: i32 = bridge.call("make_bad_destructor", ()).expect("make");

    assert!(bridge.call::<i32, i32>("release", closure).is_err());
    let poisoned = bridge.state().poisoned().expect("fatal").to_string();
    assert!(poisoned.contains("should be (i32, i32) -> ()"), "{poisoned}");
    assert!(poisoned.contains("found (i32, i32, i32) -> ()"), "{poisoned}");
}

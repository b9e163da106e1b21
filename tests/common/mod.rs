//! Shared guest scaffolding for the integration tests.
//!
//! Every test module is written in WAT. `guest` wraps the test's imports and
//! functions with the exports the bridge needs: a memory, a bump allocator
//! that grows memory on demand, a copying realloc and a no-op free.

#![allow(dead_code)]

use hostbind::runtime::Runtime;
use hostbind::state::Backends;
use hostbind::timers::ManualClock;
use hostbind::{Bridge, BridgeConfig};

/// Scratch address tests use for `(ptr, len)` output pairs.
pub const OUT: i32 = 1024;

const ALLOCATOR: &str = r#"
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  (func $malloc (export "__hb_malloc") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32) (local $end i32) (local $have i32)
    (if (i32.eqz (local.get $align)) (then (local.set $align (i32.const 1))))
    (local.set $ptr
      (i32.and
        (i32.add (global.get $heap) (i32.sub (local.get $align) (i32.const 1)))
        (i32.sub (i32.const 0) (local.get $align))))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (local.set $have (i32.mul (memory.size) (i32.const 65536)))
    (if (i32.gt_u (local.get $end) (local.get $have))
      (then
        (if (i32.eq
              (memory.grow
                (i32.shr_u
                  (i32.add (i32.sub (local.get $end) (local.get $have)) (i32.const 65535))
                  (i32.const 16)))
              (i32.const -1))
          (then (return (i32.const 0))))))
    (global.set $heap (local.get $end))
    (local.get $ptr))
  (func $realloc (export "__hb_realloc")
    (param $ptr i32) (param $old i32) (param $new i32) (param $align i32) (result i32)
    (local $dst i32)
    (if (i32.le_u (local.get $new) (local.get $old)) (then (return (local.get $ptr))))
    (local.set $dst (call $malloc (local.get $new) (local.get $align)))
    (if (i32.eqz (local.get $dst)) (then (return (i32.const 0))))
    (memory.copy (local.get $dst) (local.get $ptr) (local.get $old))
    (local.get $dst))
  (func (export "__hb_free") (param i32 i32 i32))
"#;

/// Assemble a guest module from its imports and its own definitions.
///
/// `body` must define a `__hb_start` export unless the test never starts the
/// bridge.
pub fn guest(imports: &str, body: &str) -> String {
    format!("(module\n{imports}\n{ALLOCATOR}\n{body}\n)")
}

/// Backends that never touch the network or the wall clock.
pub fn offline() -> Backends {
    Backends::default().with_clock(ManualClock::new())
}

pub fn instantiate_with(wat: &str, config: BridgeConfig, backends: Backends) -> Bridge {
    let runtime = Runtime::new();
    let module = runtime
        .load_module(wat.as_bytes())
        .expect("guest module should compile");
    module
        .instantiate_with(config, backends)
        .expect("guest module should instantiate")
}

/// Instantiate and start `wat` against offline backends.
pub fn started(wat: &str) -> Bridge {
    let mut bridge = instantiate_with(wat, BridgeConfig::default(), offline());
    bridge.start().expect("start routine should run");
    bridge
}

/// Read the `(ptr, len)` pair at `out` and decode the string it names.
pub fn read_string(bridge: &mut Bridge, out: i32) -> String {
    let (ptr, len) = read_pair(bridge, out);
    bridge.decode_string(ptr, len).expect("pair should name valid UTF-8")
}

pub fn read_pair(bridge: &mut Bridge, out: i32) -> (u32, u32) {
    let raw = bridge.read_memory(out as u32, 8).expect("pair should be in bounds");
    let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
    (word(0), word(4))
}

/// Value of an exported `() -> i32` counter.
pub fn counter(bridge: &mut Bridge, name: &str) -> i32 {
    bridge.call::<(), i32>(name, ()).expect("counter export")
}

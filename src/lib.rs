//! hostbind: a host-side bridge for WebAssembly modules
//!
//! The module manipulates host-resident objects through integer handles,
//! exchanges strings and byte buffers as `(ptr, len)` pairs in its own linear
//! memory, and registers closures the host calls back later.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Bridge runtime             │
//! │                                         │
//! │  host      - imports the module calls   │
//! │  heap      - handle table               │
//! │  codec     - strings across memories    │
//! │  closure   - callback lifetimes         │
//! │  event_loop - timers, sockets, fetches  │
//! │                                         │
//! ├─────────────────────────────────────────┤
//! │         WASM Execution (wasmtime)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let runtime = Runtime::new();
//! let module = runtime.load_file("app.wasm")?;
//! let mut bridge = module.instantiate(BridgeConfig::default())?;
//! bridge.start()?;
//! bridge.run_until_idle(usize::MAX)?;
//! ```

pub mod closure;
pub mod codec;
pub mod config;
pub mod dom;
pub mod error;
pub mod error_bridge;
pub mod event;
pub mod event_loop;
pub mod guest;
pub mod heap;
pub mod host;
pub mod memory;
pub mod net;
pub mod perf;
pub mod random;
pub mod runtime;
pub mod socket;
pub mod state;
pub mod timers;
pub mod value;

pub use config::BridgeConfig;
pub use error::{BridgeError, HostError};
pub use heap::Handle;
pub use runtime::{Bridge, Runtime, RuntimeError};
pub use state::{Backends, BridgeState};
pub use value::HostValue;

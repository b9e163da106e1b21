//! Boundary constants for the hostbind calling convention.
//!
//! Both sides of the bridge agree on these values: the host uses them when
//! registering imports and resolving exports, and guest modules use them to
//! interpret handles and status codes.
//!
//! # Conventions
//!
//! - Every boundary function takes and returns plain numbers.
//! - Strings and buffers travel as `(ptr, len)` pairs into linear memory.
//! - Functions that hand a string back write `(ptr, len)` into two
//!   consecutive 32-bit cells at a caller-supplied `out` address.
//! - [`NONE`] doubles as "absent" and as the failure sentinel; after a
//!   fallible call returns it the guest asks `error_pending`.

#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt;

/// Import module under which every host function is registered.
pub const IMPORT_MODULE: &str = "hostbind";

/// Handle/pointer value meaning "none" (and "failed" for fallible calls).
pub const NONE: i32 = 0;

/// Number of fixed constant slots at the top of the reserved region.
pub const CONSTANT_SLOTS: u32 = 4;

/// Default size of the reserved region (128 padding slots + 4 constants).
pub const DEFAULT_RESERVED_SLOTS: u32 = 132;

/// Default export names a guest module provides.
pub mod exports {
    pub const MEMORY: &str = "memory";
    pub const MALLOC: &str = "__hb_malloc";
    pub const REALLOC: &str = "__hb_realloc";
    pub const FREE: &str = "__hb_free";
    pub const START: &str = "__hb_start";
    pub const TABLE: &str = "__indirect_function_table";
}

/// The fixed constants living in the last four reserved slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    Undefined,
    Null,
    True,
    False,
}

impl Constant {
    pub const ALL: [Constant; 4] = [
        Constant::Undefined,
        Constant::Null,
        Constant::True,
        Constant::False,
    ];

    /// Slot index of this constant for a table with `reserved` slots.
    ///
    /// Returns `None` when `reserved` is too small to hold the constants.
    pub const fn slot(self, reserved: u32) -> Option<u32> {
        if reserved < CONSTANT_SLOTS {
            return None;
        }
        let base = reserved - CONSTANT_SLOTS;
        Some(match self {
            Constant::Undefined => base,
            Constant::Null => base + 1,
            Constant::True => base + 2,
            Constant::False => base + 3,
        })
    }
}

/// Runtime tag of a host value, returned by the `value_kind` import.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined = 0,
    Null = 1,
    Bool = 2,
    Number = 3,
    String = 4,
    Bytes = 5,
    Window = 6,
    Document = 7,
    Node = 8,
    Event = 9,
    Headers = 10,
    Request = 11,
    Response = 12,
    Fetch = 13,
    Socket = 14,
    Timer = 15,
    Closure = 16,
    Error = 17,
    Object = 18,
}

impl ValueKind {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ValueKind::Undefined,
            1 => ValueKind::Null,
            2 => ValueKind::Bool,
            3 => ValueKind::Number,
            4 => ValueKind::String,
            5 => ValueKind::Bytes,
            6 => ValueKind::Window,
            7 => ValueKind::Document,
            8 => ValueKind::Node,
            9 => ValueKind::Event,
            10 => ValueKind::Headers,
            11 => ValueKind::Request,
            12 => ValueKind::Response,
            13 => ValueKind::Fetch,
            14 => ValueKind::Socket,
            15 => ValueKind::Timer,
            16 => ValueKind::Closure,
            17 => ValueKind::Error,
            18 => ValueKind::Object,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Bool => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Window => "window",
            ValueKind::Document => "document",
            ValueKind::Node => "node",
            ValueKind::Event => "event",
            ValueKind::Headers => "headers",
            ValueKind::Request => "request",
            ValueKind::Response => "response",
            ValueKind::Fetch => "fetch",
            ValueKind::Socket => "socket",
            ValueKind::Timer => "timer",
            ValueKind::Closure => "closure",
            ValueKind::Error => "error",
            ValueKind::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Socket lifecycle events a guest can subscribe to with `socket_on`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
    Open = 0,
    Message = 1,
    Close = 2,
    Error = 3,
}

impl SocketEventKind {
    pub const COUNT: usize = 4;

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => SocketEventKind::Open,
            1 => SocketEventKind::Message,
            2 => SocketEventKind::Close,
            3 => SocketEventKind::Error,
            _ => return None,
        })
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Socket ready states, numbered like the browser constants.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// Severity levels accepted by the `log` import.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    /// Out-of-range levels clamp to the nearest end.
    pub const fn from_code(code: i32) -> Self {
        match code {
            i32::MIN..=0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

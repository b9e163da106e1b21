//! Host-resident values and the arenas that own mutable host objects.
//!
//! Immutable data (numbers, strings, byte buffers, errors) is stored inline
//! in [`HostValue`]. Anything with identity or interior state (nodes, sockets,
//! header lists, closures...) lives in an [`Arena`] and is referenced by id,
//! so cloning a handle aliases the same object instead of copying it.

use crate::error::{BridgeError, BridgeResult, HostError};
use hostbind_abi::{Constant, ValueKind, CONSTANT_SLOTS};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Typed index into an [`Arena`].
pub trait ArenaId: Copy + Eq + fmt::Debug {
    fn from_raw(raw: u32) -> Self;
    fn raw(self) -> u32;
}

macro_rules! arena_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u32);

            impl ArenaId for $name {
                fn from_raw(raw: u32) -> Self {
                    Self(raw)
                }

                fn raw(self) -> u32 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }
        )*
    };
}

arena_id!(
    /// A node in the document tree.
    NodeId,
    /// An event record (DOM or socket).
    EventId,
    HeadersId,
    RequestId,
    ResponseId,
    FetchId,
    SocketId,
    TimerId,
    /// A wrapped guest closure.
    ClosureId,
    /// A plain property bag.
    ObjectId,
);

/// Id-keyed storage with monotonically increasing ids.
#[derive(Debug)]
pub struct Arena<I, T> {
    items: BTreeMap<u32, T>,
    next: u32,
    _id: PhantomData<I>,
}

impl<I: ArenaId, T> Arena<I, T> {
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            next: 1,
            _id: PhantomData,
        }
    }

    pub fn insert(&mut self, item: T) -> I {
        let raw = self.next;
        self.next += 1;
        self.items.insert(raw, item);
        I::from_raw(raw)
    }

    pub fn get(&self, id: I) -> Option<&T> {
        self.items.get(&id.raw())
    }

    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.items.get_mut(&id.raw())
    }

    pub fn remove(&mut self, id: I) -> Option<T> {
        self.items.remove(&id.raw())
    }

    pub fn contains(&self, id: I) -> bool {
        self.items.contains_key(&id.raw())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> {
        self.items.iter().map(|(raw, item)| (I::from_raw(*raw), item))
    }
}

impl<I: ArenaId, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An arena record whose lifetime follows the references held to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Node(NodeId),
    Headers(HeadersId),
    Request(RequestId),
    Response(ResponseId),
    Fetch(FetchId),
    Socket(SocketId),
    Object(ObjectId),
}

/// Everything a handle can refer to.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Window,
    Document,
    Node(NodeId),
    Event(EventId),
    Headers(HeadersId),
    Request(RequestId),
    Response(ResponseId),
    Fetch(FetchId),
    Socket(SocketId),
    Timer(TimerId),
    Closure(ClosureId),
    Error(HostError),
    Object(ObjectId),
}

impl HostValue {
    /// Values for the reserved region of a table with `count` slots.
    ///
    /// Padding slots read as `undefined`; the last four hold the constants.
    pub fn reserved_constants(count: u32) -> Vec<HostValue> {
        let count = count.max(CONSTANT_SLOTS);
        let mut values = vec![HostValue::Undefined; (count - CONSTANT_SLOTS) as usize];
        values.extend(Constant::ALL.iter().map(|constant| match constant {
            Constant::Undefined => HostValue::Undefined,
            Constant::Null => HostValue::Null,
            Constant::True => HostValue::Bool(true),
            Constant::False => HostValue::Bool(false),
        }));
        values
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            HostValue::Undefined => ValueKind::Undefined,
            HostValue::Null => ValueKind::Null,
            HostValue::Bool(_) => ValueKind::Bool,
            HostValue::Number(_) => ValueKind::Number,
            HostValue::String(_) => ValueKind::String,
            HostValue::Bytes(_) => ValueKind::Bytes,
            HostValue::Window => ValueKind::Window,
            HostValue::Document => ValueKind::Document,
            HostValue::Node(_) => ValueKind::Node,
            HostValue::Event(_) => ValueKind::Event,
            HostValue::Headers(_) => ValueKind::Headers,
            HostValue::Request(_) => ValueKind::Request,
            HostValue::Response(_) => ValueKind::Response,
            HostValue::Fetch(_) => ValueKind::Fetch,
            HostValue::Socket(_) => ValueKind::Socket,
            HostValue::Timer(_) => ValueKind::Timer,
            HostValue::Closure(_) => ValueKind::Closure,
            HostValue::Error(_) => ValueKind::Error,
            HostValue::Object(_) => ValueKind::Object,
        }
    }

    /// The arena record this value keeps alive, if any.
    ///
    /// Events and timers are owned by the dispatch and the timer queue, and
    /// closures by the guest's own reference count, so none of them appear
    /// here.
    pub fn resource(&self) -> Option<Resource> {
        Some(match self {
            HostValue::Node(id) => Resource::Node(*id),
            HostValue::Headers(id) => Resource::Headers(*id),
            HostValue::Request(id) => Resource::Request(*id),
            HostValue::Response(id) => Resource::Response(*id),
            HostValue::Fetch(id) => Resource::Fetch(*id),
            HostValue::Socket(id) => Resource::Socket(*id),
            HostValue::Object(id) => Resource::Object(*id),
            _ => return None,
        })
    }

    pub fn is_falsy(&self) -> bool {
        match self {
            HostValue::Undefined | HostValue::Null => true,
            HostValue::Bool(b) => !b,
            HostValue::Number(n) => *n == 0.0 || n.is_nan(),
            HostValue::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// True for values with identity (anything that is not a primitive or a
    /// callable).
    pub fn is_object(&self) -> bool {
        !matches!(
            self,
            HostValue::Undefined
                | HostValue::Null
                | HostValue::Bool(_)
                | HostValue::Number(_)
                | HostValue::String(_)
                | HostValue::Closure(_)
        )
    }

    pub fn as_str(&self) -> BridgeResult<&str> {
        match self {
            HostValue::String(s) => Ok(s),
            other => Err(mismatch("string", other)),
        }
    }

    /// Short human-readable rendering used by `debug_string`.
    pub fn debug_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_string(),
            HostValue::Null => "null".to_string(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => n.to_string(),
            HostValue::String(s) => format!("{s:?}"),
            HostValue::Bytes(bytes) => format!("Uint8Array({})", bytes.len()),
            HostValue::Window => "Window".to_string(),
            HostValue::Document => "Document".to_string(),
            HostValue::Error(err) => err.to_string(),
            HostValue::Node(id) => id.to_string(),
            HostValue::Event(id) => id.to_string(),
            HostValue::Headers(id) => id.to_string(),
            HostValue::Request(id) => id.to_string(),
            HostValue::Response(id) => id.to_string(),
            HostValue::Fetch(id) => id.to_string(),
            HostValue::Socket(id) => id.to_string(),
            HostValue::Timer(id) => id.to_string(),
            HostValue::Closure(id) => format!("Function({id})"),
            HostValue::Object(id) => id.to_string(),
        }
    }
}

fn mismatch(expected: &str, found: &HostValue) -> BridgeError {
    BridgeError::protocol(format!("expected {expected}, found {}", found.kind()))
}

macro_rules! expect_variant {
    ($($method:ident => $variant:ident($id:ty), $what:literal;)*) => {
        impl HostValue {
            $(
                pub fn $method(&self) -> BridgeResult<$id> {
                    match self {
                        HostValue::$variant(id) => Ok(*id),
                        other => Err(mismatch($what, other)),
                    }
                }
            )*
        }
    };
}

expect_variant! {
    expect_event => Event(EventId), "event";
    expect_headers => Headers(HeadersId), "headers";
    expect_request => Request(RequestId), "request";
    expect_response => Response(ResponseId), "response";
    expect_fetch => Fetch(FetchId), "fetch";
    expect_socket => Socket(SocketId), "socket";
    expect_timer => Timer(TimerId), "timer";
    expect_closure => Closure(ClosureId), "closure";
    expect_object => Object(ObjectId), "object";
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<HostError> for HostValue {
    fn from(err: HostError) -> Self {
        HostValue::Error(err)
    }
}

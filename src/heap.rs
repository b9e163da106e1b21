//! Handle table for host-resident values.
//!
//! The guest never sees host values directly; it holds small integers that
//! index into this table. Freed slots form an intrusive free list threaded
//! through the table itself, so allocation and release are O(1) and the
//! most recently freed slot is reused first.
//!
//! The first `reserved` slots hold fixed values (padding, then `undefined`,
//! `null`, `true`, `false`). They resolve like any other handle but are never
//! freed or handed out by [`ObjectTable::allocate`].

use crate::error::{BridgeError, BridgeResult};
use std::fmt;

/// Integer reference to a slot in an [`ObjectTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// The "no value" sentinel.
    pub const NONE: Handle = Handle(0);

    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    /// Reinterpret an ABI integer as a handle.
    pub const fn from_abi(raw: i32) -> Self {
        Self(raw as u32)
    }

    pub const fn to_abi(self) -> i32 {
        self.0 as i32
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
enum Slot<V> {
    Reserved(V),
    Live(V),
    /// Link to the next free slot (equal to the table length at the tail).
    Free(usize),
}

/// Slot table mapping handles to values.
#[derive(Debug)]
pub struct ObjectTable<V> {
    slots: Vec<Slot<V>>,
    next_free: usize,
    reserved: usize,
    live: usize,
}

impl<V: Clone> ObjectTable<V> {
    /// Create a table whose first slots are permanently bound to `reserved`.
    pub fn with_reserved(reserved: Vec<V>) -> Self {
        let slots: Vec<Slot<V>> = reserved.into_iter().map(Slot::Reserved).collect();
        let reserved = slots.len();
        Self {
            slots,
            next_free: reserved,
            reserved,
            live: 0,
        }
    }

    /// Store `value` and return its handle.
    pub fn allocate(&mut self, value: V) -> Handle {
        let head = match self.slots.get(self.next_free) {
            Some(Slot::Free(next)) => Some(*next),
            _ => None,
        };

        let index = match head {
            Some(next) => std::mem::replace(&mut self.next_free, next),
            None => {
                // Free list exhausted: grow by one slot.
                let index = self.slots.len();
                self.slots.push(Slot::Free(index + 1));
                self.next_free = index + 1;
                index
            }
        };

        self.slots[index] = Slot::Live(value);
        self.live += 1;
        Handle(index as u32)
    }

    pub fn get(&self, handle: Handle) -> BridgeResult<&V> {
        match self.slots.get(handle.index() as usize) {
            Some(Slot::Reserved(value)) | Some(Slot::Live(value)) => Ok(value),
            Some(Slot::Free(_)) => Err(BridgeError::protocol(format!(
                "handle {handle} is not live"
            ))),
            None => Err(BridgeError::protocol(format!(
                "handle {handle} is out of range"
            ))),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> BridgeResult<&mut V> {
        match self.slots.get_mut(handle.index() as usize) {
            Some(Slot::Live(value)) => Ok(value),
            Some(Slot::Reserved(_)) => Err(BridgeError::protocol(format!(
                "reserved handle {handle} is immutable"
            ))),
            Some(Slot::Free(_)) => Err(BridgeError::protocol(format!(
                "handle {handle} is not live"
            ))),
            None => Err(BridgeError::protocol(format!(
                "handle {handle} is out of range"
            ))),
        }
    }

    /// Remove the value behind `handle`, returning its slot to the free list.
    ///
    /// Taking a reserved handle yields its constant and frees nothing.
    pub fn take(&mut self, handle: Handle) -> BridgeResult<V> {
        let index = handle.index() as usize;
        match self.slots.get(index) {
            Some(Slot::Reserved(value)) => return Ok(value.clone()),
            Some(Slot::Live(_)) => {}
            Some(Slot::Free(_)) => {
                return Err(BridgeError::protocol(format!(
                    "handle {handle} taken twice"
                )))
            }
            None => {
                return Err(BridgeError::protocol(format!(
                    "handle {handle} is out of range"
                )))
            }
        }

        let slot = std::mem::replace(&mut self.slots[index], Slot::Free(self.next_free));
        self.next_free = index;
        self.live -= 1;
        match slot {
            Slot::Live(value) => Ok(value),
            _ => Err(BridgeError::protocol(format!(
                "slot {handle} changed state during take"
            ))),
        }
    }

    /// Release a handle without looking at its value.
    pub fn drop_ref(&mut self, handle: Handle) -> BridgeResult<()> {
        self.take(handle).map(drop)
    }

    /// Store another reference to the value behind `handle` in a fresh slot.
    pub fn clone_ref(&mut self, handle: Handle) -> BridgeResult<Handle> {
        let value = self.get(handle)?.clone();
        Ok(self.allocate(value))
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        matches!(
            self.slots.get(handle.index() as usize),
            Some(Slot::Live(_))
        )
    }

    pub fn is_reserved(&self, handle: Handle) -> bool {
        (handle.index() as usize) < self.reserved
    }

    /// Number of values currently held outside the reserved region.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Total number of slots, reserved ones included.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

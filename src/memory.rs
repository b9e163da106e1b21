//! Access to the guest's linear memory.
//!
//! The guest owns its memory and may grow it whenever it allocates. The host
//! therefore never keeps a view across a call that can reach the guest
//! allocator: every access goes through [`MemoryView`], which compares the
//! current memory size against the size it last saw and refreshes (and
//! counts) the view when the memory has been resized underneath it.

use crate::error::{BridgeError, BridgeResult};
use crate::heap::Handle;
use std::ops::Range;

/// Bookkeeping for views over a growable linear memory.
#[derive(Debug, Default)]
pub struct MemoryView {
    cached_len: usize,
    generation: u64,
}

impl MemoryView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremented every time the view had to be recreated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn refresh(&mut self, len: usize) {
        if len == self.cached_len {
            return;
        }
        if self.cached_len != 0 {
            tracing::trace!(
                from = self.cached_len,
                to = len,
                "linear memory resized; recreating view"
            );
        }
        self.cached_len = len;
        self.generation += 1;
    }

    pub fn bytes<'m>(&mut self, data: &'m [u8]) -> &'m [u8] {
        self.refresh(data.len());
        data
    }

    pub fn bytes_mut<'m>(&mut self, data: &'m mut [u8]) -> &'m mut [u8] {
        self.refresh(data.len());
        data
    }

    /// 32-bit cell view used for multi-value output slots.
    pub fn words32<'m>(&mut self, data: &'m mut [u8]) -> Words32<'m> {
        self.refresh(data.len());
        Words32 { bytes: data }
    }
}

/// Little-endian 32-bit cells over linear memory.
pub struct Words32<'m> {
    bytes: &'m mut [u8],
}

impl Words32<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> BridgeResult<i32> {
        let cell = self.cell(index)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[cell]);
        Ok(i32::from_le_bytes(raw))
    }

    pub fn set(&mut self, index: usize, value: i32) -> BridgeResult<()> {
        let cell = self.cell(index)?;
        self.bytes[cell].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn cell(&self, index: usize) -> BridgeResult<Range<usize>> {
        if index >= self.len() {
            return Err(BridgeError::protocol(format!(
                "32-bit cell {index} is outside linear memory"
            )));
        }
        Ok(index * 4..index * 4 + 4)
    }
}

/// Byte range `[ptr, ptr + len)` checked against a memory of `size` bytes.
pub fn checked_range(ptr: u32, len: u32, size: usize) -> BridgeResult<Range<usize>> {
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .filter(|end| *end <= size)
        .ok_or_else(|| {
            BridgeError::protocol(format!(
                "range {ptr}+{len} is outside linear memory of {size} bytes"
            ))
        })?;
    Ok(start..end)
}

/// The guest side of a boundary call: its memory and its allocator.
///
/// Implemented over a live wasmtime caller by [`crate::guest::Guest`] and
/// over plain vectors in tests.
pub trait GuestMemory {
    /// Current memory contents together with the view bookkeeping.
    fn memory(&mut self) -> (&mut [u8], &mut MemoryView);

    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32>;

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> BridgeResult<u32>;

    fn free(&mut self, ptr: u32, size: u32, align: u32) -> BridgeResult<()>;

    /// Whether the guest exports a reallocation entry point.
    fn has_realloc(&self) -> bool;

    /// Resolve a host string the guest refers to by handle.
    fn interned(&self, handle: Handle) -> BridgeResult<String> {
        Err(BridgeError::protocol(format!(
            "interned string {handle} passed to a guest without a handle table"
        )))
    }

    fn read_bytes(&mut self, ptr: u32, len: u32) -> BridgeResult<Vec<u8>> {
        let (data, view) = self.memory();
        let bytes = view.bytes(data);
        let range = checked_range(ptr, len, bytes.len())?;
        Ok(bytes[range].to_vec())
    }

    /// Strict UTF-8 decode; never substitutes replacement characters.
    fn read_utf8(&mut self, ptr: u32, len: u32) -> BridgeResult<String> {
        let (data, view) = self.memory();
        let bytes = view.bytes(data);
        let range = checked_range(ptr, len, bytes.len())?;
        std::str::from_utf8(&bytes[range])
            .map(str::to_owned)
            .map_err(|err| {
                BridgeError::Decode(format!(
                    "invalid UTF-8 at byte {} of string at {ptr}",
                    err.valid_up_to()
                ))
            })
    }

    fn write_bytes(&mut self, ptr: u32, src: &[u8]) -> BridgeResult<()> {
        let len = u32::try_from(src.len())
            .map_err(|_| BridgeError::AllocationFailure("buffer exceeds 4 GiB".into()))?;
        let (data, view) = self.memory();
        let bytes = view.bytes_mut(data);
        let range = checked_range(ptr, len, bytes.len())?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }

    /// Write `(first, second)` into the two cells at `out`.
    fn write_pair(&mut self, out: u32, first: i32, second: i32) -> BridgeResult<()> {
        if out % 4 != 0 {
            return Err(BridgeError::protocol(format!(
                "output slot {out} is not 4-byte aligned"
            )));
        }
        let (data, view) = self.memory();
        let mut words = view.words32(data);
        let index = (out / 4) as usize;
        words.set(index, first)?;
        words.set(index + 1, second)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Vector-backed guest used by unit tests.

    use super::*;
    use crate::heap::ObjectTable;
    use crate::value::HostValue;

    /// Bump-allocating guest whose memory is a `Vec<u8>`.
    ///
    /// Allocations past the end grow the vector, which the view observes as
    /// a resize exactly like a real `memory.grow`.
    pub struct VecGuest {
        pub data: Vec<u8>,
        pub view: MemoryView,
        pub next: u32,
        pub realloc_enabled: bool,
        pub reallocs: Vec<(u32, u32, u32)>,
        pub frees: Vec<(u32, u32)>,
        pub table: ObjectTable<HostValue>,
    }

    impl VecGuest {
        pub fn new(size: usize) -> Self {
            Self {
                data: vec![0; size],
                view: MemoryView::new(),
                next: 8,
                realloc_enabled: true,
                reallocs: Vec::new(),
                frees: Vec::new(),
                table: ObjectTable::with_reserved(HostValue::reserved_constants(4)),
            }
        }

        pub fn without_realloc(size: usize) -> Self {
            Self {
                realloc_enabled: false,
                ..Self::new(size)
            }
        }
    }

    impl GuestMemory for VecGuest {
        fn memory(&mut self) -> (&mut [u8], &mut MemoryView) {
            (&mut self.data, &mut self.view)
        }

        fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
            let align = align.max(1);
            let ptr = self.next.div_ceil(align) * align;
            self.next = ptr + size;
            if self.next as usize > self.data.len() {
                let grown = (self.next as usize).next_power_of_two();
                self.data.resize(grown, 0);
            }
            Ok(ptr)
        }

        fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> BridgeResult<u32> {
            self.reallocs.push((ptr, old_size, new_size));
            let new_ptr = self.malloc(new_size, align)?;
            let old = ptr as usize..(ptr + old_size.min(new_size)) as usize;
            self.data.copy_within(old, new_ptr as usize);
            Ok(new_ptr)
        }

        fn free(&mut self, ptr: u32, size: u32, _align: u32) -> BridgeResult<()> {
            self.frees.push((ptr, size));
            Ok(())
        }

        fn has_realloc(&self) -> bool {
            self.realloc_enabled
        }

        fn interned(&self, handle: Handle) -> BridgeResult<String> {
            self.table.get(handle)?.as_str().map(str::to_owned)
        }
    }
}

//! Moving strings and byte buffers across the boundary.
//!
//! Host strings are written into buffers the guest allocates. The common
//! case of pure ASCII is copied straight into a buffer sized by the string's
//! UTF-16 length; the first non-ASCII character switches to a reallocated
//! buffer with room for three bytes per remaining code unit, which is the
//! UTF-8 worst case.

use crate::error::{BridgeError, BridgeResult};
use crate::heap::Handle;
use crate::memory::GuestMemory;

fn wire_len(len: usize) -> BridgeResult<u32> {
    u32::try_from(len).map_err(|_| {
        BridgeError::AllocationFailure(format!("{len} bytes exceed the 32-bit address space"))
    })
}

/// Encode `text` into guest memory, returning `(ptr, len)` of the UTF-8 bytes.
pub fn encode<G: GuestMemory + ?Sized>(guest: &mut G, text: &str) -> BridgeResult<(u32, u32)> {
    let bytes = text.as_bytes();

    if !guest.has_realloc() {
        let len = wire_len(bytes.len())?;
        let ptr = guest.malloc(len, 1)?;
        guest.write_bytes(ptr, bytes)?;
        return Ok((ptr, len));
    }

    let units = text.encode_utf16().count();
    let initial = wire_len(units)?;
    let mut ptr = guest.malloc(initial, 1)?;

    let ascii = bytes.iter().position(|b| !b.is_ascii()).unwrap_or(bytes.len());
    guest.write_bytes(ptr, &bytes[..ascii])?;
    if ascii == bytes.len() {
        return Ok((ptr, initial));
    }

    let rest = &bytes[ascii..];
    let remaining = units - ascii;
    let budget = remaining
        .checked_mul(3)
        .and_then(|n| n.checked_add(ascii))
        .ok_or_else(|| BridgeError::AllocationFailure("string too large to encode".into()))?;
    let budget = wire_len(budget)?;

    ptr = guest.realloc(ptr, initial, budget, 1)?;
    let offset = wire_len(ascii)?;
    let tail = ptr
        .checked_add(offset)
        .ok_or_else(|| BridgeError::protocol(format!("buffer at {ptr} cannot hold {ascii} more bytes")))?;
    guest.write_bytes(tail, rest)?;

    let len = wire_len(bytes.len())?;
    if len < budget {
        ptr = guest.realloc(ptr, budget, len, 1)?;
    }
    Ok((ptr, len))
}

/// Strictly decode the UTF-8 bytes at `(ptr, len)`.
pub fn decode<G: GuestMemory + ?Sized>(guest: &mut G, ptr: u32, len: u32) -> BridgeResult<String> {
    guest.read_utf8(ptr, len)
}

/// Decode a string whose buffer the guest handed over, then free the buffer.
///
/// The buffer is released whether or not decoding succeeds.
pub fn decode_owned<G: GuestMemory + ?Sized>(
    guest: &mut G,
    ptr: u32,
    len: u32,
) -> BridgeResult<String> {
    let text = guest.read_utf8(ptr, len);
    if ptr != 0 {
        guest.free(ptr, len, 1)?;
    }
    text
}

/// Decode a string argument that may already live on the host.
///
/// A zero pointer means the guest is passing an interned string: `len` is
/// then the handle of a host string.
pub fn decode_cached<G: GuestMemory + ?Sized>(guest: &mut G, ptr: u32, len: u32) -> BridgeResult<String> {
    if ptr == 0 {
        return guest.interned(Handle::new(len));
    }
    guest.read_utf8(ptr, len)
}

/// Copy `bytes` into a fresh guest allocation.
pub fn pass_bytes<G: GuestMemory + ?Sized>(guest: &mut G, bytes: &[u8]) -> BridgeResult<(u32, u32)> {
    let len = wire_len(bytes.len())?;
    let ptr = guest.malloc(len, 1)?;
    guest.write_bytes(ptr, bytes)?;
    Ok((ptr, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::VecGuest;
    use crate::value::HostValue;

    fn roundtrip(guest: &mut VecGuest, text: &str) -> (u32, u32) {
        let (ptr, len) = encode(guest, text).expect("encode");
        assert_eq!(decode(guest, ptr, len).expect("decode"), text);
        (ptr, len)
    }

    #[test]
    fn ascii_needs_no_reallocation() {
        let mut guest = VecGuest::new(64);
        let (_, len) = roundtrip(&mut guest, "hello");
        assert_eq!(len, 5);
        assert!(guest.reallocs.is_empty());
    }

    #[test]
    fn first_non_ascii_char_triggers_one_growth() {
        let mut guest = VecGuest::new(64);
        let (_, len) = roundtrip(&mut guest, "h\u{e9}llo");
        assert_eq!(len, 6);
        let (_, old, new) = guest.reallocs[0];
        assert_eq!((old, new), (5, 13));
        // Shrinks to the real length afterwards.
        assert_eq!(guest.reallocs[1].2, 6);
    }

    #[test]
    fn astral_characters_fit_the_budget() {
        let mut guest = VecGuest::new(64);
        let (_, len) = roundtrip(&mut guest, "ok \u{1f600}!");
        assert_eq!(len, "ok \u{1f600}!".len() as u32);
    }

    #[test]
    fn empty_string_encodes_to_zero_length() {
        let mut guest = VecGuest::new(64);
        let (_, len) = encode(&mut guest, "").expect("encode");
        assert_eq!(len, 0);
    }

    #[test]
    fn encoding_survives_memory_growth() {
        // 16 bytes of memory: the initial allocation fits, the realloc grows it.
        let mut guest = VecGuest::new(16);
        let text = "abc\u{4e16}\u{754c}";
        roundtrip(&mut guest, text);
        assert!(guest.data.len() > 16);
        assert!(guest.view.generation() >= 2);
    }

    #[test]
    fn falls_back_to_exact_encode_without_realloc() {
        let mut guest = VecGuest::without_realloc(64);
        let (_, len) = roundtrip(&mut guest, "na\u{ef}ve");
        assert_eq!(len, 6);
        assert!(guest.reallocs.is_empty());
    }

    #[test]
    fn owned_strings_are_freed_even_when_invalid() {
        let mut guest = VecGuest::new(64);
        guest.write_bytes(16, &[0xff, 0xfe]).expect("write");
        let err = decode_owned(&mut guest, 16, 2).expect_err("invalid");
        assert!(matches!(err, BridgeError::Decode(_)));
        assert_eq!(guest.frees, vec![(16, 2)]);
    }

    #[test]
    fn zero_pointer_reads_an_interned_string() {
        let mut guest = VecGuest::new(64);
        let handle = guest.table.allocate(HostValue::from("cached"));
        let text = decode_cached(&mut guest, 0, handle.index()).expect("cached");
        assert_eq!(text, "cached");

        let number = guest.table.allocate(HostValue::Number(1.0));
        assert!(decode_cached(&mut guest, 0, number.index()).is_err());

        guest.write_bytes(16, b"inline").expect("write");
        assert_eq!(decode_cached(&mut guest, 16, 6).expect("inline"), "inline");
    }

    /// Hands out a reallocated buffer whose tail would wrap the address space.
    struct WrappingRealloc(VecGuest);

    impl GuestMemory for WrappingRealloc {
        fn memory(&mut self) -> (&mut [u8], &mut crate::memory::MemoryView) {
            self.0.memory()
        }

        fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
            self.0.malloc(size, align)
        }

        fn realloc(&mut self, _ptr: u32, _old: u32, _new: u32, _align: u32) -> BridgeResult<u32> {
            Ok(u32::MAX - 1)
        }

        fn free(&mut self, ptr: u32, size: u32, align: u32) -> BridgeResult<()> {
            self.0.free(ptr, size, align)
        }

        fn has_realloc(&self) -> bool {
            true
        }
    }

    #[test]
    fn reallocated_buffer_near_the_top_of_memory_is_rejected() {
        let mut guest = WrappingRealloc(VecGuest::new(64));
        let err = encode(&mut guest, "abc\u{e9}").expect_err("tail would wrap");
        assert!(matches!(err, BridgeError::ProtocolViolation(_)), "{err:?}");
    }
}

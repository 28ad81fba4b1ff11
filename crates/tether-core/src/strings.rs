//! String marshaling between host text and guest UTF-8.
//!
//! Encoding asks the guest allocator for room, writes the bytes through a
//! freshly validated view after every allocator call (any of them may grow
//! memory), and hands back the pointer and byte length. Decoding reads a
//! byte range through the view cache and validates it strictly.

use tracing::debug;

use crate::config::DEFAULT_DECODER_BYTE_CEILING;
use crate::error::{BridgeResult, DecodeError, MemoryError};
use crate::guest::{GuestAllocator, GuestMemory};
use crate::memory::MemoryViews;

/// A `(pointer, byte length)` pair in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestSlice {
    pub ptr: u32,
    pub len: u32,
}

fn guest_len(len: usize) -> Result<u32, MemoryError> {
    u32::try_from(len).map_err(|_| MemoryError::LengthOverflow(len))
}

/// Copy `text` into a fresh guest allocation.
///
/// The first allocation is sized by the text's UTF-16 length and filled with
/// the ASCII prefix. If non-ASCII text remains, the allocation is grown to
/// three bytes per remaining UTF-16 unit, which bounds any UTF-8 encoding of
/// it, filled, then shrunk to the exact byte length. Guests without
/// `realloc` get a single exact allocation instead.
pub fn encode<G>(guest: &mut G, views: &MemoryViews, text: &str) -> BridgeResult<GuestSlice>
where
    G: GuestAllocator + GuestMemory + ?Sized,
{
    if !guest.supports_realloc() {
        return encode_exact(guest, views, text);
    }

    let units = guest_len(text.encode_utf16().count())?;
    let mut ptr = guest.malloc(units, 1)?;

    let ascii = text
        .bytes()
        .position(|byte| byte > 0x7f)
        .unwrap_or(text.len());
    views.write_bytes(guest, ptr, &text.as_bytes()[..ascii])?;

    if ascii == text.len() {
        return Ok(GuestSlice { ptr, len: units });
    }

    // Every ASCII byte is one UTF-16 unit.
    let prefix = ascii as u32;
    let rest = &text[ascii..];
    let grown = guest_len(ascii + (units - prefix) as usize * 3)?;
    ptr = guest.realloc(ptr, units, grown, 1)?;
    views.write_bytes(guest, ptr + prefix, rest.as_bytes())?;

    let len = guest_len(text.len())?;
    ptr = guest.realloc(ptr, grown, len, 1)?;
    Ok(GuestSlice { ptr, len })
}

/// Copy `text` into a guest allocation of exactly its UTF-8 length.
pub fn encode_exact<G>(guest: &mut G, views: &MemoryViews, text: &str) -> BridgeResult<GuestSlice>
where
    G: GuestAllocator + GuestMemory + ?Sized,
{
    let len = guest_len(text.len())?;
    let ptr = guest.malloc(len, 1)?;
    views.write_bytes(guest, ptr, text.as_bytes())?;
    Ok(GuestSlice { ptr, len })
}

/// Read and validate `[ptr, ptr + len)` as UTF-8.
pub fn decode<M>(
    memory: &M,
    views: &MemoryViews,
    decoder: &mut Utf8Decoder,
    ptr: u32,
    len: u32,
) -> BridgeResult<String>
where
    M: GuestMemory + ?Sized,
{
    let bytes = views.bytes(memory, ptr, len)?;
    Ok(decoder.decode(bytes)?.to_owned())
}

/// A strict UTF-8 decoder that retires itself after a byte budget.
///
/// Some host decoders fail after processing roughly 2 GiB in total. The
/// decoder counts cumulative input and starts a fresh instance once the
/// count reaches its ceiling; the count then restarts at the size of the
/// input that triggered the replacement.
#[derive(Debug)]
pub struct Utf8Decoder {
    bytes_decoded: u64,
    total_bytes: u64,
    ceiling: u64,
    instances: u64,
}

impl Utf8Decoder {
    pub fn new(ceiling: u64) -> Self {
        Self {
            bytes_decoded: 0,
            total_bytes: 0,
            ceiling,
            instances: 1,
        }
    }

    /// Validate `bytes` as UTF-8.
    pub fn decode<'a>(&mut self, bytes: &'a [u8]) -> Result<&'a str, DecodeError> {
        let len = bytes.len() as u64;
        self.total_bytes = self.total_bytes.saturating_add(len);
        self.bytes_decoded = self.bytes_decoded.saturating_add(len);
        if self.bytes_decoded >= self.ceiling {
            self.instances += 1;
            debug!(
                ceiling = self.ceiling,
                instances = self.instances,
                "Replacing text decoder"
            );
            self.bytes_decoded = len;
        }
        Ok(std::str::from_utf8(bytes)?)
    }

    /// Bytes attributed to the current decoder instance.
    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// Bytes decoded across every instance.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of decoder instances created so far.
    pub fn instances(&self) -> u64 {
        self.instances
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_DECODER_BYTE_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AllocCall, SimulatedGuest};

    fn round_trip(guest: &mut SimulatedGuest, text: &str) -> (GuestSlice, String) {
        let views = MemoryViews::new();
        let slice = encode(guest, &views, text).unwrap();
        let mut decoder = Utf8Decoder::default();
        let decoded = decode(&*guest, &views, &mut decoder, slice.ptr, slice.len).unwrap();
        (slice, decoded)
    }

    #[test]
    fn test_ascii_single_allocation() {
        let mut guest = SimulatedGuest::new();
        let (slice, decoded) = round_trip(&mut guest, "hello");

        assert_eq!(decoded, "hello");
        assert_eq!(slice.len, 5);
        assert_eq!(guest.alloc_calls(), &[AllocCall::Malloc { size: 5, align: 1 }]);
    }

    #[test]
    fn test_mixed_text_straddles_fast_path() {
        let mut guest = SimulatedGuest::new();
        let (slice, decoded) = round_trip(&mut guest, "abc€def");

        assert_eq!(decoded, "abc€def");
        assert_eq!(slice.len, 9);

        let calls = guest.alloc_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], AllocCall::Malloc { size: 7, align: 1 });
        assert!(matches!(
            calls[1],
            AllocCall::Realloc { old_size: 7, new_size: 15, .. }
        ));
        assert!(matches!(
            calls[2],
            AllocCall::Realloc { old_size: 15, new_size: 9, .. }
        ));
    }

    #[test]
    fn test_no_ascii_prefix() {
        let mut guest = SimulatedGuest::new();
        let (slice, decoded) = round_trip(&mut guest, "日本語");

        assert_eq!(decoded, "日本語");
        assert_eq!(slice.len, 9);
        assert!(matches!(
            guest.alloc_calls()[1],
            AllocCall::Realloc { old_size: 3, new_size: 9, .. }
        ));
    }

    #[test]
    fn test_supplementary_characters_fit() {
        let mut guest = SimulatedGuest::new();
        let text = "x🎨y😀";
        let (slice, decoded) = round_trip(&mut guest, text);

        assert_eq!(decoded, text);
        assert_eq!(slice.len as usize, text.len());
    }

    #[test]
    fn test_empty_string() {
        let mut guest = SimulatedGuest::new();
        let (slice, decoded) = round_trip(&mut guest, "");
        assert_eq!(slice.len, 0);
        assert_eq!(decoded, "");
    }

    #[test]
    fn test_exact_path_without_realloc() {
        let mut guest = SimulatedGuest::new().without_realloc();
        let (slice, decoded) = round_trip(&mut guest, "naïve café");

        assert_eq!(decoded, "naïve café");
        assert_eq!(slice.len as usize, "naïve café".len());
        assert_eq!(
            guest.alloc_calls(),
            &[AllocCall::Malloc {
                size: slice.len,
                align: 1
            }]
        );
    }

    #[test]
    fn test_encode_survives_memory_growth() {
        let mut guest = SimulatedGuest::new();
        let big = "é".repeat(40_000);
        let (slice, decoded) = round_trip(&mut guest, &big);

        assert_eq!(decoded, big);
        assert_eq!(slice.len, 80_000);
        assert!(guest.memory().pages() > 1);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut decoder = Utf8Decoder::default();
        let err = decoder.decode(&[0x68, 0xff, 0xfe]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidUtf8 {
                valid_up_to: 1,
                error_len: Some(1)
            }
        );
    }

    #[test]
    fn test_decoder_replaced_at_ceiling() {
        let mut decoder = Utf8Decoder::new(10);

        decoder.decode(b"abcd").unwrap();
        decoder.decode(b"efgh").unwrap();
        assert_eq!(decoder.instances(), 1);
        assert_eq!(decoder.bytes_decoded(), 8);

        assert_eq!(decoder.decode(b"ijk").unwrap(), "ijk");
        assert_eq!(decoder.instances(), 2);
        assert_eq!(decoder.bytes_decoded(), 3);
        assert_eq!(decoder.total_bytes(), 11);
    }
}

//! Marshaling between guest linear memory and host state.
//!
//! Every guest-supplied offset and length is untrusted: all access goes
//! through checked slicing, and any out-of-bounds range raises a
//! [`ProtocolViolation`] that traps the guest. The helpers operate on
//! plain byte slices so they compose with wasmtime's
//! `Memory::data_and_store_mut` split borrow and stay trivially
//! testable.
//!
//! Two ABI conventions live here:
//!
//! - **write-if-fits**: the guest passes `(buf, buf_limit)`; the host
//!   computes the required byte count `n`, writes only when
//!   `0 < n <= buf_limit`, and returns `n` either way so the guest can
//!   grow its buffer and retry. `buf_limit == 0` is a pure size query.
//! - **NUL-terminated list**: multi-valued results are written
//!   back-to-back, each item followed by a single `0x00`, and the
//!   return value packs `(count << 32) | byte_count`.

use weft_core::abi::pack_list;
use weft_core::ProtocolViolation;

/// Borrow a checked range of guest memory.
pub fn read_bytes(mem: &[u8], offset: u32, len: u32) -> Result<&[u8], ProtocolViolation> {
    let start = offset as usize;
    let end = start
        .checked_add(len as usize)
        .filter(|end| *end <= mem.len())
        .ok_or(ProtocolViolation::OutOfBounds {
            offset: u64::from(offset),
            len: u64::from(len),
            memory_len: mem.len() as u64,
        })?;
    Ok(&mem[start..end])
}

/// Read a UTF-8 string out of guest memory.
///
/// `call` names the ABI function for the violation message when the
/// bytes are not valid UTF-8.
pub fn read_string(
    mem: &[u8],
    offset: u32,
    len: u32,
    call: &'static str,
) -> Result<String, ProtocolViolation> {
    let bytes = read_bytes(mem, offset, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| ProtocolViolation::InvalidUtf8 { call })
}

/// Copy `data` into guest memory at `offset`.
pub fn write_bytes(mem: &mut [u8], offset: u32, data: &[u8]) -> Result<(), ProtocolViolation> {
    let start = offset as usize;
    let end = start
        .checked_add(data.len())
        .filter(|end| *end <= mem.len())
        .ok_or(ProtocolViolation::OutOfBounds {
            offset: u64::from(offset),
            len: data.len() as u64,
            memory_len: mem.len() as u64,
        })?;
    mem[start..end].copy_from_slice(data);
    Ok(())
}

/// The write-if-fits protocol. Returns the required length regardless of
/// whether anything was written.
pub fn write_if_fits(
    mem: &mut [u8],
    buf: u32,
    buf_limit: u32,
    data: &[u8],
) -> Result<u32, ProtocolViolation> {
    let n = data.len() as u32;
    if n > 0 && n <= buf_limit {
        write_bytes(mem, buf, data)?;
    }
    Ok(n)
}

/// The NUL-terminated-list protocol.
///
/// Nothing is written when the encoded list does not fit in `buf_limit`;
/// the packed `(count, byte_count)` return lets the guest size a retry.
pub fn write_terminated_list(
    mem: &mut [u8],
    buf: u32,
    buf_limit: u32,
    items: &[Vec<u8>],
) -> Result<u64, ProtocolViolation> {
    let count = items.len() as u32;
    let byte_count: usize = items.iter().map(|item| item.len() + 1).sum();
    let byte_count = byte_count as u32;

    if count > 0 && byte_count <= buf_limit {
        let mut offset = buf;
        for item in items {
            write_bytes(mem, offset, item)?;
            write_bytes(mem, offset + item.len() as u32, &[0])?;
            offset += item.len() as u32 + 1;
        }
    }
    Ok(pack_list(count, byte_count))
}

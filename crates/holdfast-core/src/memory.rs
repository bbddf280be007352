//! # Memory Primitives
//!
//! Typed reads and writes over the substrate's raw address-space access.
//!
//! Every operation here is a thin, stateless layer over
//! [`MemoryAccess`](crate::substrate::MemoryAccess): scalars are encoded
//! little-endian at the requested width, strings are NUL-terminated UTF-8, and
//! failures surface as `MemoryAccess` errors carrying the faulting address.
//!
//! ## Strings
//!
//! [`Memory::read_string`] reads at most `max_length` bytes and stops at the
//! first NUL. Reads are split at page boundaries so a string that ends just
//! before an unmapped page is still returned in full; only a failure on the
//! very first page is an error. Invalid UTF-8 is decoded lossily.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::trace;

use crate::error::{HoldfastError, HoldfastResult};
use crate::substrate::{MemoryAccess, Substrate};
use crate::types::{Address, Scalar, Width};

/// Granularity used when walking strings across pages.
pub const PAGE_SIZE: u64 = 4096;

/// Default `max_length` for string reads.
pub const DEFAULT_STRING_MAX_LENGTH: usize = 256;

const HEXDUMP_LINE: usize = 16;

fn page_align_down(value: u64) -> u64
{
    value & !(PAGE_SIZE - 1)
}

/// Read a NUL-terminated string of at most `max_length` bytes.
///
/// Shared by [`Memory::read_string`] and the string scanner.
pub(crate) fn read_c_string<M>(memory: &M, address: Address, max_length: usize) -> HoldfastResult<String>
where
    M: MemoryAccess + ?Sized,
{
    let mut bytes = Vec::new();
    let mut cursor = address;

    while bytes.len() < max_length {
        let page_end = page_align_down(cursor.value()).saturating_add(PAGE_SIZE);
        let until_page_end = usize::try_from(page_end - cursor.value()).unwrap_or(usize::MAX);
        let chunk_len = until_page_end.min(max_length - bytes.len());

        let chunk = match memory.read_memory(cursor, chunk_len) {
            Ok(chunk) => chunk,
            Err(err) if bytes.is_empty() => return Err(err),
            Err(_) => break,
        };

        if let Some(nul) = chunk.iter().position(|byte| *byte == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            break;
        }
        bytes.extend_from_slice(&chunk);
        cursor = cursor + chunk_len as u64;
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Typed memory access for the control channel.
#[derive(Clone)]
pub struct Memory
{
    substrate: Arc<dyn Substrate>,
}

impl std::fmt::Debug for Memory
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Memory").finish_non_exhaustive()
    }
}

impl Memory
{
    /// Create memory primitives over `substrate`.
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>) -> Self
    {
        Self { substrate }
    }

    /// Read a scalar of `width` bytes at `address`.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the address is unmapped or unreadable
    pub fn read(&self, address: Address, width: Width, signed: bool) -> HoldfastResult<Scalar>
    {
        let bytes = self.substrate.read_memory(address, width.bytes())?;
        Scalar::decode(&bytes, width, signed)
    }

    /// Write `value` truncated to `width` bytes at `address`, interpreted as
    /// two's complement when `signed` is set.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the address is unmapped or not writable
    pub fn write(&self, address: Address, value: Scalar, width: Width, signed: bool) -> HoldfastResult<()>
    {
        let value = value.normalize(width, signed)?;
        trace!(address = %address, value = %value, width = %width, signed, "Writing scalar");
        self.substrate.write_memory(address, &value.encode(width))
    }

    /// Read `length` raw bytes at `address`.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: part of the range is unmapped or unreadable
    pub fn read_bytes(&self, address: Address, length: usize) -> HoldfastResult<Vec<u8>>
    {
        self.substrate.read_memory(address, length)
    }

    /// Write raw `bytes` at `address`.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: part of the range is unmapped or not writable
    pub fn write_bytes(&self, address: Address, bytes: &[u8]) -> HoldfastResult<()>
    {
        self.substrate.write_memory(address, bytes)
    }

    /// Read a NUL-terminated UTF-8 string of at most `max_length` bytes.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: the first byte is unmapped or unreadable
    pub fn read_string(&self, address: Address, max_length: usize) -> HoldfastResult<String>
    {
        read_c_string(self.substrate.as_ref(), address, max_length)
    }

    /// Write `value` as UTF-8 followed by a NUL terminator.
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: part of the destination is unmapped or not writable
    pub fn write_string(&self, address: Address, value: &str) -> HoldfastResult<()>
    {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.substrate.write_memory(address, &bytes)
    }

    /// Canonical hexdump of `length` bytes at `address`
    ///
    /// One header line, then one line per 16 bytes: the address, the bytes in
    /// hex, and a printable-ASCII gutter with `.` for everything else.
    ///
    /// ```text
    ///            0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F  0123456789ABCDEF
    /// 00001000  68 6f 6c 64 66 61 73 74 00                       holdfast.
    /// ```
    ///
    /// ## Errors
    ///
    /// - `MemoryAccess`: part of the range is unmapped or unreadable
    /// - `InvalidArgument`: `length` is zero
    pub fn hexdump(&self, address: Address, length: usize) -> HoldfastResult<String>
    {
        if length == 0 {
            return Err(HoldfastError::InvalidArgument("hexdump length must be positive".to_string()));
        }
        let bytes = self.substrate.read_memory(address, length)?;
        Ok(format_hexdump(address, &bytes))
    }
}

fn format_hexdump(address: Address, bytes: &[u8]) -> String
{
    let last = address + bytes.len().saturating_sub(1) as u64;
    let digits = format!("{last:x}").len().max(8);

    let mut out = String::new();
    let _ = write!(out, "{:digits$}  ", "");
    for column in 0..HEXDUMP_LINE {
        let _ = write!(out, "{column:>2X} ");
    }
    out.push_str(" 0123456789ABCDEF\n");

    for (index, line) in bytes.chunks(HEXDUMP_LINE).enumerate() {
        let line_address = address + (index * HEXDUMP_LINE) as u64;
        let _ = write!(out, "{line_address:0digits$x}  ");
        for byte in line {
            let _ = write!(out, "{byte:02x} ");
        }
        for _ in line.len()..HEXDUMP_LINE {
            out.push_str("   ");
        }
        out.push(' ');
        for byte in line {
            out.push(if byte.is_ascii_graphic() || *byte == b' ' { char::from(*byte) } else { '.' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_hexdump_layout()
    {
        let dump = format_hexdump(Address::from(0x1000), b"holdfast\0");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" F  0123456789ABCDEF"));
        assert!(lines[1].starts_with("00001000  68 6f 6c 64 66 61 73 74 00 "));
        assert!(lines[1].ends_with(" holdfast."));
    }

    #[test]
    fn test_hexdump_wraps_every_sixteen_bytes()
    {
        let bytes: Vec<u8> = (0u8..40).collect();
        let dump = format_hexdump(Address::from(0x2000), &bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("00002010  10 11"));
        assert!(lines[3].starts_with("00002020  20 21"));
    }

    #[test]
    fn test_page_align_down()
    {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_down(0x2000), 0x2000);
    }
}

//! Memory range and protection types.

use std::fmt;
use std::str::FromStr;

use super::Address;
use crate::error::HoldfastError;

/// Page protection flags
///
/// Parsed from and displayed as the familiar three-character form used by
/// `/proc/<pid>/maps` and most instrumentation hosts: `"rw-"`, `"r-x"`, ...
///
/// When used as a *filter*, a protection matches every range that grants at
/// least the requested permissions (`"rw-"` matches `"rwx"` ranges too).
///
/// ```rust
/// use holdfast_core::types::Protection;
///
/// let rw: Protection = "rw-".parse()?;
/// assert!(rw.write);
/// assert!(!rw.execute);
/// assert!("rwx".parse::<Protection>()?.satisfies(rw));
/// # Ok::<(), holdfast_core::error::HoldfastError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protection
{
    /// Readable
    pub read: bool,
    /// Writable
    pub write: bool,
    /// Executable
    pub execute: bool,
}

impl Protection
{
    /// `rw-`: the protection every scan walks.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        execute: false,
    };

    /// `r-x`: code ranges.
    pub const READ_EXECUTE: Self = Self {
        read: true,
        write: false,
        execute: true,
    };

    /// `true` if this protection grants every permission present in `filter`.
    #[must_use]
    pub fn satisfies(self, filter: Protection) -> bool
    {
        (!filter.read || self.read) && (!filter.write || self.write) && (!filter.execute || self.execute)
    }
}

impl FromStr for Protection
{
    type Err = HoldfastError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        let bytes = s.as_bytes();
        let flag = |index: usize, expected: u8| -> Result<bool, HoldfastError> {
            match bytes.get(index) {
                Some(&b) if b == expected => Ok(true),
                Some(b'-') => Ok(false),
                _ => Err(HoldfastError::InvalidArgument(format!("malformed protection: {s:?}"))),
            }
        };
        if bytes.len() != 3 {
            return Err(HoldfastError::InvalidArgument(format!("malformed protection: {s:?}")));
        }
        Ok(Self {
            read: flag(0, b'r')?,
            write: flag(1, b'w')?,
            execute: flag(2, b'x')?,
        })
    }
}

impl fmt::Display for Protection
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' }
        )
    }
}

/// Contiguous mapped range in the target's address space
///
/// Mirrors what the substrate reports when enumerating ranges: a base, a size,
/// the protection and, for file-backed mappings, the backing file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRange
{
    /// First address of the range (inclusive)
    pub base: Address,
    /// Length in bytes
    pub size: u64,
    /// Page protection
    pub protection: Protection,
    /// Backing file, if the range maps one
    pub file: Option<String>,
}

impl MemoryRange
{
    /// Create a new memory range
    #[must_use]
    pub fn new(base: Address, size: u64, protection: Protection, file: Option<String>) -> Self
    {
        Self {
            base,
            size,
            protection,
            file,
        }
    }

    /// End address of the range (exclusive), saturating at the top of the address space.
    #[must_use]
    pub fn end(&self) -> Address
    {
        self.base.saturating_add(self.size)
    }

    /// Check if an address lies within this range
    ///
    /// ```rust
    /// use holdfast_core::types::{Address, MemoryRange, Protection};
    ///
    /// let range = MemoryRange::new(Address::from(0x1000), 0x1000, Protection::READ_WRITE, None);
    /// assert!(range.contains(Address::from(0x1000))); // Start (inclusive)
    /// assert!(!range.contains(Address::from(0x2000))); // End (exclusive)
    /// ```
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base && address < self.end()
    }

    /// `true` if the range is file-backed and the path contains any of `needles`.
    #[must_use]
    pub fn matches_any(&self, needles: &[String]) -> bool
    {
        self.file
            .as_deref()
            .is_some_and(|path| needles.iter().any(|needle| path.contains(needle.as_str())))
    }
}

/// Operator-facing description of a mapped code module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap
{
    /// Path of the backing file
    pub name: String,
    /// Base address of the mapping
    pub base_address: Address,
    /// Protection of the mapping
    pub protection: Protection,
}

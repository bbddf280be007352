//! Fixed-width scalar values as they live in target memory.

use std::fmt;

use crate::error::{HoldfastError, HoldfastResult};

/// Width of a scalar access in bytes
///
/// Only the four natural integer widths are supported. Anything else is
/// rejected with `InvalidArgument` when converting from a raw byte count.
///
/// ```rust
/// use holdfast_core::types::Width;
///
/// assert_eq!(Width::try_from(4)?, Width::Four);
/// assert!(Width::try_from(3).is_err());
/// # Ok::<(), holdfast_core::error::HoldfastError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Width
{
    /// 8-bit access
    One,
    /// 16-bit access
    Two,
    /// 32-bit access (the control channel default)
    #[default]
    Four,
    /// 64-bit access
    Eight,
}

impl Width
{
    /// Number of bytes covered by this width.
    #[must_use]
    pub const fn bytes(self) -> usize
    {
        match self {
            Width::One => 1,
            Width::Two => 2,
            Width::Four => 4,
            Width::Eight => 8,
        }
    }
}

impl TryFrom<usize> for Width
{
    type Error = HoldfastError;

    fn try_from(value: usize) -> Result<Self, Self::Error>
    {
        match value {
            1 => Ok(Width::One),
            2 => Ok(Width::Two),
            4 => Ok(Width::Four),
            8 => Ok(Width::Eight),
            other => Err(HoldfastError::InvalidArgument(format!(
                "unsupported width: {other} (expected 1, 2, 4 or 8)"
            ))),
        }
    }
}

impl fmt::Display for Width
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.bytes())
    }
}

/// Integer value read from or written to target memory
///
/// The variant records how the bytes were (or should be) interpreted. Encoding
/// always truncates to the requested width using two's complement, so
/// `Scalar::Signed(-1)` at width 2 encodes as `ff ff` and `Scalar::Unsigned(0x1_0000_002a)`
/// at width 4 encodes as `2a 00 00 00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar
{
    /// Value interpreted as unsigned
    Unsigned(u64),
    /// Value interpreted as signed
    Signed(i64),
}

impl Scalar
{
    /// Raw 64-bit pattern of the value (two's complement for signed values).
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn bits(self) -> u64
    {
        match self {
            Scalar::Unsigned(value) => value,
            Scalar::Signed(value) => value as u64,
        }
    }

    /// Little-endian encoding truncated to `width`.
    #[must_use]
    pub fn encode(self, width: Width) -> Vec<u8>
    {
        self.bits().to_le_bytes()[..width.bytes()].to_vec()
    }

    /// Decode little-endian `bytes` of exactly `width` bytes.
    ///
    /// Signed decoding sign-extends from the top bit of the width.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: `bytes` is not exactly `width` bytes long
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode(bytes: &[u8], width: Width, signed: bool) -> HoldfastResult<Self>
    {
        let size = width.bytes();
        if bytes.len() != size {
            return Err(HoldfastError::InvalidArgument(format!(
                "expected {size} bytes, got {}",
                bytes.len()
            )));
        }
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(bytes);
        let unsigned = u64::from_le_bytes(raw);
        if !signed {
            return Ok(Scalar::Unsigned(unsigned));
        }
        let shift = 64 - (size as u32) * 8;
        Ok(Scalar::Signed(((unsigned << shift) as i64) >> shift))
    }

    /// Reinterpret the value under the given signedness and width.
    ///
    /// Used when a value provided by the operator must be compared with, or
    /// reported next to, a value decoded from memory.
    ///
    /// ## Errors
    ///
    /// Never fails for the four supported widths; the `Result` mirrors [`Scalar::decode`].
    pub fn normalize(self, width: Width, signed: bool) -> HoldfastResult<Self>
    {
        Self::decode(&self.encode(width), width, signed)
    }
}

impl From<u64> for Scalar
{
    fn from(value: u64) -> Self
    {
        Scalar::Unsigned(value)
    }
}

impl From<u32> for Scalar
{
    fn from(value: u32) -> Self
    {
        Scalar::Unsigned(u64::from(value))
    }
}

impl From<i64> for Scalar
{
    fn from(value: i64) -> Self
    {
        Scalar::Signed(value)
    }
}

impl From<i32> for Scalar
{
    fn from(value: i32) -> Self
    {
        Scalar::Signed(i64::from(value))
    }
}

impl fmt::Display for Scalar
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Scalar::Unsigned(value) => write!(f, "{value}"),
            Scalar::Signed(value) => write!(f, "{value}"),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_encode_truncates_to_width()
    {
        assert_eq!(Scalar::Unsigned(0x1_0000_002a).encode(Width::Four), vec![0x2a, 0, 0, 0]);
        assert_eq!(Scalar::Signed(-1).encode(Width::Two), vec![0xff, 0xff]);
        assert_eq!(Scalar::Unsigned(42).encode(Width::One), vec![42]);
    }

    #[test]
    fn test_decode_sign_extends()
    {
        let value = Scalar::decode(&[0xfe], Width::One, true).unwrap();
        assert_eq!(value, Scalar::Signed(-2));

        let value = Scalar::decode(&[0xfe], Width::One, false).unwrap();
        assert_eq!(value, Scalar::Unsigned(254));

        let value = Scalar::decode(&[0, 0, 0, 0x80], Width::Four, true).unwrap();
        assert_eq!(value, Scalar::Signed(i64::from(i32::MIN)));
    }

    #[test]
    fn test_decode_rejects_wrong_length()
    {
        assert!(Scalar::decode(&[1, 2, 3], Width::Four, false).is_err());
    }

    #[test]
    fn test_normalize_matches_memory_view()
    {
        let operator_value = Scalar::Signed(-1);
        assert_eq!(
            operator_value.normalize(Width::One, false).unwrap(),
            Scalar::Unsigned(255)
        );
    }

    #[test]
    fn test_width_try_from()
    {
        for (raw, width) in [(1, Width::One), (2, Width::Two), (4, Width::Four), (8, Width::Eight)] {
            assert_eq!(Width::try_from(raw).unwrap(), width);
            assert_eq!(width.bytes(), raw);
        }
        assert!(matches!(Width::try_from(0), Err(HoldfastError::InvalidArgument(_))));
        assert!(matches!(Width::try_from(16), Err(HoldfastError::InvalidArgument(_))));
    }
}

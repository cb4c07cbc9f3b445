//! Utility functions for byte-level processing.
//!
//! This module provides small primitives shared by the parser and the patch
//! engine:
//! - Unaligned big-endian and little-endian reads (via byteorder)
//! - Hex string parsing and formatting for patch payloads
//! - Offset parsing for values that arrive as integers or hex strings
//! - Checked range arithmetic for buffer accesses

use std::ops::Range;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a big-endian u32 from a byte slice at the given offset.
///
/// Returns `None` if the read would run past the end of `data`.
#[inline(always)]
pub fn read_u32_be_at(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    data.get(offset..end).map(BigEndian::read_u32)
}

/// Reads a little-endian u32 from a byte slice at the given offset.
///
/// Returns `None` if the read would run past the end of `data`.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    data.get(offset..end).map(LittleEndian::read_u32)
}

// =============================================================================
// Ranges
// =============================================================================

/// Converts `offset..offset + len` into a usize range inside a buffer of
/// `size` bytes.
///
/// Returns `None` on overflow or if any part of the range is out of bounds.
#[inline]
pub fn checked_range(offset: u64, len: usize, size: usize) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(len)?;
    (end <= size).then_some(start..end)
}

/// Applies a signed shift to an offset, returning `None` on underflow or
/// overflow.
#[inline]
pub fn shift_offset(offset: u64, shift: i64) -> Option<u64> {
    offset.checked_add_signed(shift)
}

/// Returns true if `a` and `b` share at least one byte.
#[inline]
pub fn ranges_overlap(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

// =============================================================================
// Hex
// =============================================================================

/// Parses a hex string into bytes.
///
/// Accepts both contiguous (`"4989C490"`) and space-separated (`"49 89 C4 90"`)
/// forms, in either case.
pub fn parse_hex(value: &str) -> Result<Vec<u8>> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|_| Error::InvalidHex {
        value: value.to_string(),
    })
}

/// Parses an optional hex string, treating `None` and blank strings as absent.
pub fn parse_hex_opt(value: Option<&str>) -> Result<Option<Vec<u8>>> {
    match value {
        Some(s) if !s.trim().is_empty() => parse_hex(s).map(Some),
        _ => Ok(None),
    }
}

/// Formats bytes as a lowercase contiguous hex string.
#[inline]
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

// =============================================================================
// Offsets
// =============================================================================

/// Parses an offset given as a string.
///
/// Offsets in string form are always hexadecimal, with or without a `0x`
/// prefix.
pub fn parse_offset(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).map_err(|_| Error::InvalidOffset {
        value: value.to_string(),
    })
}

/// Formats a byte count for display.
pub fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u32_be_at() {
        let data = [0xCA, 0xFE, 0xBA, 0xBE, 0x00];
        assert_eq!(read_u32_be_at(&data, 0), Some(0xCAFEBABE));
        assert_eq!(read_u32_be_at(&data, 2), None);
        assert_eq!(read_u32_be_at(&data, usize::MAX), None);
    }

    #[test]
    fn test_read_u32_le_at() {
        let data = [0xCF, 0xFA, 0xED, 0xFE];
        assert_eq!(read_u32_le_at(&data, 0), Some(0xFEEDFACF));
    }

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range(0x10, 4, 0x20), Some(0x10..0x14));
        assert_eq!(checked_range(0x1C, 4, 0x20), Some(0x1C..0x20));
        assert_eq!(checked_range(0x1D, 4, 0x20), None);
        assert_eq!(checked_range(u64::MAX, 1, 0x20), None);
    }

    #[test]
    fn test_shift_offset() {
        assert_eq!(shift_offset(0x5000, -0x1000), Some(0x4000));
        assert_eq!(shift_offset(0x5000, 0x10), Some(0x5010));
        assert_eq!(shift_offset(0x10, -0x20), None);
    }

    #[test]
    fn test_ranges_overlap() {
        assert!(ranges_overlap(&(0..10), &(9..12)));
        assert!(!ranges_overlap(&(0..10), &(10..12)));
        assert!(ranges_overlap(&(5..6), &(0..100)));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("4989C490").unwrap(), vec![0x49, 0x89, 0xC4, 0x90]);
        assert_eq!(parse_hex("49 89 c4 90").unwrap(), vec![0x49, 0x89, 0xC4, 0x90]);
        assert!(parse_hex("ABC").is_err());
        assert!(parse_hex("zz").is_err());
        assert_eq!(parse_hex_opt(Some("  ")).unwrap(), None);
        assert_eq!(parse_hex_opt(None).unwrap(), None);
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("0xA296FF").unwrap(), 0xA296FF);
        assert_eq!(parse_offset("a296ff").unwrap(), 0xA296FF);
        assert!(parse_offset("0xZZ").is_err());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0xDC, 0x05]), "00dc05");
    }
}

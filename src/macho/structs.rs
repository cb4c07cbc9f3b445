//! Fat container structures.
//!
//! These structures match the on-disk format of the fat header and its slice
//! table. Every field is stored big-endian regardless of the host.

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::constants::*;

// =============================================================================
// Fat Header
// =============================================================================

/// Fat binary header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FatHeader {
    /// Magic number (FAT_MAGIC or FAT_MAGIC_64)
    pub magic: U32,
    /// Number of slice table entries that follow
    pub nfat_arch: U32,
}

impl FatHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 8;

    /// Creates a header with the given magic and entry count.
    pub fn new(magic: u32, nfat_arch: u32) -> Self {
        Self {
            magic: U32::new(magic),
            nfat_arch: U32::new(nfat_arch),
        }
    }

    /// Returns true if the magic names a fat container.
    #[inline]
    pub fn is_valid(&self) -> bool {
        matches!(self.magic.get(), FAT_MAGIC | FAT_MAGIC_64)
    }

    /// Returns true if the slice table uses 64-bit entries.
    #[inline]
    pub fn is_64(&self) -> bool {
        self.magic.get() == FAT_MAGIC_64
    }

    /// Returns the stride of one slice table entry.
    #[inline]
    pub fn entry_size(&self) -> usize {
        if self.is_64() {
            FatArch64::SIZE
        } else {
            FatArch::SIZE
        }
    }
}

// =============================================================================
// Slice Table Entries
// =============================================================================

/// 32-bit slice table entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FatArch {
    /// CPU type
    pub cputype: U32,
    /// CPU subtype
    pub cpusubtype: U32,
    /// File offset of the slice
    pub offset: U32,
    /// Size of the slice
    pub size: U32,
    /// Alignment as a power of two
    pub align: U32,
}

impl FatArch {
    /// Size of the entry in bytes.
    pub const SIZE: usize = 20;

    /// Creates an entry.
    pub fn new(cputype: u32, cpusubtype: u32, offset: u32, size: u32, align: u32) -> Self {
        Self {
            cputype: U32::new(cputype),
            cpusubtype: U32::new(cpusubtype),
            offset: U32::new(offset),
            size: U32::new(size),
            align: U32::new(align),
        }
    }
}

/// 64-bit slice table entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FatArch64 {
    /// CPU type
    pub cputype: U32,
    /// CPU subtype
    pub cpusubtype: U32,
    /// File offset of the slice
    pub offset: U64,
    /// Size of the slice
    pub size: U64,
    /// Alignment as a power of two
    pub align: U32,
    /// Reserved
    pub reserved: U32,
}

impl FatArch64 {
    /// Size of the entry in bytes.
    pub const SIZE: usize = 32;

    /// Creates an entry.
    pub fn new(cputype: u32, cpusubtype: u32, offset: u64, size: u64, align: u32) -> Self {
        Self {
            cputype: U32::new(cputype),
            cpusubtype: U32::new(cpusubtype),
            offset: U64::new(offset),
            size: U64::new(size),
            align: U32::new(align),
            reserved: U32::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<FatHeader>(), FatHeader::SIZE);
        assert_eq!(std::mem::size_of::<FatArch>(), FatArch::SIZE);
        assert_eq!(std::mem::size_of::<FatArch64>(), FatArch64::SIZE);
    }

    #[test]
    fn test_header_is_big_endian() {
        let header = FatHeader::new(FAT_MAGIC, 2);
        assert_eq!(header.as_bytes(), &[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 2]);
        assert!(header.is_valid());
        assert_eq!(header.entry_size(), FatArch::SIZE);
        assert_eq!(FatHeader::new(FAT_MAGIC_64, 1).entry_size(), FatArch64::SIZE);
    }
}

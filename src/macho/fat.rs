//! Fat container parsing.
//!
//! A fat (universal) binary starts with a big-endian [`FatHeader`] followed by a
//! table of slice descriptors. Parsing here is deliberately forgiving: callers
//! get an empty slice table for anything that is not a well-formed fat header,
//! and only [`try_parse_slice_table`] reports why.

use std::fmt;
use std::str::FromStr;

use tracing::debug;
use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::read_u32_le_at;

// =============================================================================
// Architecture
// =============================================================================

/// Architecture of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    /// Intel 64-bit
    X86_64,
    /// Apple Silicon / ARM 64-bit
    Arm64,
    /// Any other CPU type, kept verbatim
    Other(u32),
}

impl Arch {
    /// Maps a Mach-O CPU type to an architecture.
    pub fn from_cputype(cputype: u32) -> Self {
        match cputype {
            CPU_TYPE_X86_64 => Arch::X86_64,
            CPU_TYPE_ARM64 => Arch::Arm64,
            other => Arch::Other(other),
        }
    }

    /// Returns the Mach-O CPU type.
    pub fn cputype(&self) -> u32 {
        match self {
            Arch::X86_64 => CPU_TYPE_X86_64,
            Arch::Arm64 => CPU_TYPE_ARM64,
            Arch::Other(cputype) => *cputype,
        }
    }

    /// Parses the architecture tag used in discovery documents.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86_64" => Some(Arch::X86_64),
            "arm64" | "arm64e" => Some(Arch::Arm64),
            _ => None,
        }
    }

    /// Returns the architecture tag.
    pub fn name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
            Arch::Other(_) => "unknown",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Other(cputype) => write!(f, "cpu({:#x})", cputype),
            _ => f.write_str(self.name()),
        }
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Arch::from_name(s).ok_or_else(|| Error::HeaderMalformed {
            reason: format!("unknown architecture tag '{}'", s),
        })
    }
}

// =============================================================================
// Slice Table
// =============================================================================

/// One architecture slice inside a fat container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceDescriptor {
    /// Slice architecture
    pub arch: Arch,
    /// CPU subtype as recorded in the table
    pub cpusubtype: u32,
    /// File offset of the slice (its base)
    pub file_offset: u64,
    /// Slice size in bytes
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl SliceDescriptor {
    /// Returns the end offset (exclusive) of the slice.
    #[inline]
    pub fn end(&self) -> u64 {
        self.file_offset.saturating_add(self.size)
    }

    /// Returns true if the slice covers the given file offset.
    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.end()
    }
}

/// Kind of container a file turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Fat container with 32-bit slice entries
    Fat,
    /// Fat container with 64-bit slice entries
    Fat64,
    /// Single-architecture Mach-O
    Thin(Arch),
    /// Anything else
    Unknown,
}

/// Parsed slice table of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceTable {
    /// Container kind
    pub kind: ContainerKind,
    /// Slices in table order (empty for non-fat files)
    pub slices: Vec<SliceDescriptor>,
}

impl SliceTable {
    /// Returns an empty table for a file of unknown layout.
    pub fn empty() -> Self {
        Self {
            kind: ContainerKind::Unknown,
            slices: Vec::new(),
        }
    }

    /// Returns true if this is a fat container.
    #[inline]
    pub fn is_fat(&self) -> bool {
        matches!(self.kind, ContainerKind::Fat | ContainerKind::Fat64)
    }

    /// Returns the first slice for the given architecture.
    pub fn slice(&self, arch: Arch) -> Option<&SliceDescriptor> {
        self.slices.iter().find(|s| s.arch == arch)
    }

    /// Returns the base file offset of the given architecture.
    ///
    /// A thin image of the same architecture has base 0.
    pub fn base_of(&self, arch: Arch) -> Option<u64> {
        match self.kind {
            ContainerKind::Thin(thin) if thin == arch => Some(0),
            _ => self.slice(arch).map(|s| s.file_offset),
        }
    }

    /// Returns the slice covering a file offset.
    pub fn slice_containing(&self, offset: u64) -> Option<&SliceDescriptor> {
        self.slices.iter().find(|s| s.contains(offset))
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Parses the slice table, reporting why a header could not be read.
///
/// Non-fat files are not an error: they produce a table with no slices and a
/// [`ContainerKind::Thin`] or [`ContainerKind::Unknown`] kind. Only a buffer too
/// short to hold a fat header is rejected.
pub fn try_parse_slice_table(data: &[u8]) -> Result<SliceTable> {
    if data.len() < FatHeader::SIZE {
        return Err(Error::HeaderMalformed {
            reason: format!(
                "buffer is {} bytes, fat header needs {}",
                data.len(),
                FatHeader::SIZE
            ),
        });
    }

    let header = FatHeader::read_from_prefix(data)
        .map_err(|_| Error::HeaderMalformed {
            reason: "unreadable fat header".into(),
        })?
        .0;

    if !header.is_valid() {
        return Ok(SliceTable {
            kind: sniff_thin(data),
            slices: Vec::new(),
        });
    }

    let declared = header.nfat_arch.get() as usize;
    let count = declared.min(MAX_FAT_ARCHS);
    if declared > MAX_FAT_ARCHS {
        debug!(
            "fat header declares {} slices, reading first {}",
            declared, MAX_FAT_ARCHS
        );
    }

    let stride = header.entry_size();
    let mut slices = Vec::with_capacity(count);

    for i in 0..count {
        let offset = FatHeader::SIZE + i * stride;
        if offset + stride > data.len() {
            debug!("slice table truncated after {} entries", i);
            break;
        }

        let entry = &data[offset..offset + stride];
        let slice = if header.is_64() {
            let Ok((arch, _)) = FatArch64::read_from_prefix(entry) else {
                break;
            };
            SliceDescriptor {
                arch: Arch::from_cputype(arch.cputype.get()),
                cpusubtype: arch.cpusubtype.get(),
                file_offset: arch.offset.get(),
                size: arch.size.get(),
                align: arch.align.get(),
            }
        } else {
            let Ok((arch, _)) = FatArch::read_from_prefix(entry) else {
                break;
            };
            SliceDescriptor {
                arch: Arch::from_cputype(arch.cputype.get()),
                cpusubtype: arch.cpusubtype.get(),
                file_offset: arch.offset.get() as u64,
                size: arch.size.get() as u64,
                align: arch.align.get(),
            }
        };
        slices.push(slice);
    }

    Ok(SliceTable {
        kind: if header.is_64() {
            ContainerKind::Fat64
        } else {
            ContainerKind::Fat
        },
        slices,
    })
}

/// Parses the slice table, degrading to an empty table on any problem.
pub fn parse_slice_table(data: &[u8]) -> SliceTable {
    match try_parse_slice_table(data) {
        Ok(table) => table,
        Err(e) => {
            debug!("treating file as having no slices: {}", e);
            SliceTable::empty()
        }
    }
}

/// Identifies a thin Mach-O by its little-endian header.
fn sniff_thin(data: &[u8]) -> ContainerKind {
    match read_u32_le_at(data, 0) {
        Some(MH_MAGIC_64) | Some(MH_MAGIC) => match read_u32_le_at(data, 4) {
            Some(cputype) => ContainerKind::Thin(Arch::from_cputype(cputype)),
            None => ContainerKind::Unknown,
        },
        _ => ContainerKind::Unknown,
    }
}

/// Serializes a 32-bit fat header and slice table.
///
/// Used to lay out synthetic containers; the result is exactly
/// `FatHeader::SIZE + slices.len() * FatArch::SIZE` bytes.
pub fn build_fat_header(slices: &[SliceDescriptor]) -> Vec<u8> {
    use zerocopy::IntoBytes;

    let mut out = Vec::with_capacity(FatHeader::SIZE + slices.len() * FatArch::SIZE);
    out.extend_from_slice(FatHeader::new(FAT_MAGIC, slices.len() as u32).as_bytes());
    for s in slices {
        let entry = FatArch::new(
            s.arch.cputype(),
            s.cpusubtype,
            s.file_offset as u32,
            s.size as u32,
            s.align,
        );
        out.extend_from_slice(entry.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn slice(arch: Arch, file_offset: u64, size: u64) -> SliceDescriptor {
        SliceDescriptor {
            arch,
            cpusubtype: 0,
            file_offset,
            size,
            align: 14,
        }
    }

    fn create_fat(slices: &[SliceDescriptor], len: usize) -> Vec<u8> {
        let mut data = build_fat_header(slices);
        data.resize(len, 0);
        data
    }

    #[test]
    fn test_parse_two_slices() {
        let data = create_fat(
            &[slice(Arch::X86_64, 0x1000, 0x3000), slice(Arch::Arm64, 0x4000, 0x3000)],
            0x7000,
        );
        let table = parse_slice_table(&data);

        assert_eq!(table.kind, ContainerKind::Fat);
        assert_eq!(table.slices.len(), 2);
        assert_eq!(table.base_of(Arch::X86_64), Some(0x1000));
        assert_eq!(table.base_of(Arch::Arm64), Some(0x4000));
        assert_eq!(table.slice_containing(0x4100).unwrap().arch, Arch::Arm64);
        assert!(table.slice_containing(0x10).is_none());
    }

    #[test]
    fn test_parse_fat64() {
        let mut data = FatHeader::new(FAT_MAGIC_64, 1).as_bytes().to_vec();
        data.extend_from_slice(
            FatArch64::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, 0x1_0000_0000, 0x10, 14)
                .as_bytes(),
        );
        let table = parse_slice_table(&data);

        assert_eq!(table.kind, ContainerKind::Fat64);
        assert_eq!(table.base_of(Arch::Arm64), Some(0x1_0000_0000));
    }

    #[test]
    fn test_thin_is_not_an_error() {
        let mut data = vec![0u8; 0x40];
        data[..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        data[4..8].copy_from_slice(&CPU_TYPE_X86_64.to_le_bytes());
        let table = try_parse_slice_table(&data).unwrap();

        assert_eq!(table.kind, ContainerKind::Thin(Arch::X86_64));
        assert!(table.slices.is_empty());
        assert_eq!(table.base_of(Arch::X86_64), Some(0));
        assert_eq!(table.base_of(Arch::Arm64), None);
    }

    #[test]
    fn test_short_buffer() {
        assert!(matches!(
            try_parse_slice_table(&[0xCA, 0xFE]),
            Err(Error::HeaderMalformed { .. })
        ));
        assert_eq!(parse_slice_table(&[0xCA, 0xFE]), SliceTable::empty());
        assert_eq!(parse_slice_table(&[]), SliceTable::empty());
    }

    #[test]
    fn test_truncated_table_stops_early() {
        let data = build_fat_header(&[
            slice(Arch::X86_64, 0x1000, 0x10),
            slice(Arch::Arm64, 0x2000, 0x10),
        ]);
        // Keep the header and one full entry plus half of the second.
        let cut = &data[..FatHeader::SIZE + FatArch::SIZE + FatArch::SIZE / 2];
        let table = parse_slice_table(cut);

        assert_eq!(table.slices.len(), 1);
        assert_eq!(table.slices[0].arch, Arch::X86_64);
    }

    #[test]
    fn test_slice_count_is_clamped() {
        let mut data = FatHeader::new(FAT_MAGIC, 0xFFFF_FFFF).as_bytes().to_vec();
        for i in 0..(MAX_FAT_ARCHS + 5) {
            data.extend_from_slice(
                FatArch::new(CPU_TYPE_X86_64, 0, 0x1000 * i as u32, 0x10, 12).as_bytes(),
            );
        }
        let table = parse_slice_table(&data);

        assert_eq!(table.slices.len(), MAX_FAT_ARCHS);
    }

    #[test]
    fn test_unknown_magic() {
        let table = parse_slice_table(&[0u8; 64]);
        assert_eq!(table.kind, ContainerKind::Unknown);
        assert!(table.slices.is_empty());
    }

    #[test]
    fn test_arch_names() {
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Arm64);
        assert_eq!(Arch::from_cputype(CPU_TYPE_X86_64), Arch::X86_64);
        assert_eq!(Arch::Other(7).to_string(), "cpu(0x7)");
        assert!("ppc".parse::<Arch>().is_err());
    }
}

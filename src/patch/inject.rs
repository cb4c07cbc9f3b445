//! Code injection into reserved code caves.
//!
//! Injection is all-or-nothing: every blob of a session is validated (size,
//! bounds, pairwise overlap) before the first byte is copied, so a rejected
//! set leaves the image untouched.

use std::ops::Range;

use goblin::elf::Elf;
use goblin::mach::{Mach, MachO};
use goblin::Object;
use tracing::{debug, info};

use super::known::InjectionSiteKind;
use super::site::InjectionSite;
use crate::error::{Error, Result};
use crate::image::BinaryImage;
use crate::util::{checked_range, ranges_overlap};

/// A compiled, self-contained function placed at a fixed file offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionBlob {
    /// Blob name
    pub name: String,
    /// Absolute file offset
    pub offset: u64,
    /// Machine code
    pub bytes: Vec<u8>,
    /// Size of the reserved cave
    pub max_size: usize,
}

impl InjectionBlob {
    /// Creates a blob.
    pub fn new(name: impl Into<String>, offset: u64, bytes: Vec<u8>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            offset,
            bytes,
            max_size,
        }
    }

    /// Creates the blob for an injection site.
    pub fn for_site(site: &InjectionSite, bytes: Vec<u8>, max_size: usize) -> Self {
        Self::new(site.kind.name(), site.offset, bytes, max_size)
    }

    /// Returns the file range the blob occupies.
    #[inline]
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset.saturating_add(self.bytes.len() as u64)
    }

    /// Checks the blob's own size limits.
    pub fn validate_size(&self) -> Result<()> {
        if self.bytes.is_empty() {
            return Err(Error::EmptyInjection {
                name: self.name.clone(),
            });
        }
        if self.bytes.len() > self.max_size {
            return Err(Error::InjectionSizeExceeded {
                name: self.name.clone(),
                size: self.bytes.len(),
                max: self.max_size,
            });
        }
        Ok(())
    }
}

/// Validates a set of blobs against an image of `image_len` bytes.
pub fn validate_blobs(blobs: &[InjectionBlob], image_len: usize) -> Result<()> {
    for blob in blobs {
        blob.validate_size()?;
        if checked_range(blob.offset, blob.bytes.len(), image_len).is_none() {
            return Err(Error::out_of_bounds(
                &blob.name,
                blob.offset,
                blob.bytes.len(),
                image_len,
            ));
        }
    }

    for (i, a) in blobs.iter().enumerate() {
        for b in &blobs[i + 1..] {
            if ranges_overlap(&a.range(), &b.range()) {
                return Err(Error::InjectionOverlap {
                    first: a.name.clone(),
                    second: b.name.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Validates and copies every blob into the image.
///
/// Returns the number of bytes written.
pub fn place_blobs(image: &mut BinaryImage, blobs: &[InjectionBlob]) -> Result<usize> {
    validate_blobs(blobs, image.len())?;

    let mut written = 0;
    for blob in blobs {
        image.write(&blob.name, blob.offset, &blob.bytes)?;
        info!(
            "  injected {} at {:#x} ({} bytes)",
            blob.name,
            blob.offset,
            blob.bytes.len()
        );
        written += blob.bytes.len();
    }
    Ok(written)
}

// =============================================================================
// Compiled Artifacts
// =============================================================================

/// Location of a symbol inside an artifact.
#[derive(Debug, Clone, Copy)]
struct SymbolLocation {
    section: usize,
    file_offset: u64,
}

/// Extracts the bytes between a function symbol and its end marker.
///
/// `artifact` is a single-architecture Mach-O or ELF object or executable. The
/// blob length is the distance from `start` to `end`; both symbols must live in
/// the same section.
pub fn extract_blob(artifact: &[u8], start: &str, end: &str) -> Result<Vec<u8>> {
    let object = Object::parse(artifact).map_err(|e| Error::InvalidArtifact {
        reason: e.to_string(),
    })?;

    let (begin, finish) = match object {
        Object::Mach(Mach::Binary(macho)) => {
            (locate_macho(&macho, start)?, locate_macho(&macho, end)?)
        }
        Object::Elf(elf) => (locate_elf(&elf, start)?, locate_elf(&elf, end)?),
        Object::Mach(Mach::Fat(_)) => {
            return Err(Error::InvalidArtifact {
                reason: "fat artifact; build the payload for a single architecture".into(),
            })
        }
        _ => {
            return Err(Error::InvalidArtifact {
                reason: "unsupported object format".into(),
            })
        }
    };

    if begin.section != finish.section {
        return Err(Error::InvalidArtifact {
            reason: format!("'{}' and '{}' are in different sections", start, end),
        });
    }
    if finish.file_offset <= begin.file_offset {
        return Err(Error::EmptyInjection {
            name: start.to_string(),
        });
    }

    let len = (finish.file_offset - begin.file_offset) as usize;
    let range = checked_range(begin.file_offset, len, artifact.len()).ok_or_else(|| {
        Error::InvalidArtifact {
            reason: format!("'{}' extends past the end of the artifact", start),
        }
    })?;

    debug!("extracted {} ({} bytes)", start, len);
    Ok(artifact[range].to_vec())
}

/// Extracts the payload for an injection site from a compiled artifact.
pub fn extract_site_blob(artifact: &[u8], kind: InjectionSiteKind) -> Result<Vec<u8>> {
    let (start, end) = kind.symbols();
    extract_blob(artifact, start, end)
}

fn locate_macho(macho: &MachO<'_>, symbol: &str) -> Result<SymbolLocation> {
    let mangled = format!("_{}", symbol);
    let mut address = None;
    for entry in macho.symbols() {
        let (name, nlist) = entry.map_err(|e| Error::InvalidArtifact {
            reason: e.to_string(),
        })?;
        // n_sect == 0 is an undefined symbol
        if nlist.n_sect != 0 && (name == mangled || name == symbol) {
            address = Some(nlist.n_value);
            break;
        }
    }
    let address = address.ok_or_else(|| Error::BlobSymbolNotFound {
        symbol: symbol.to_string(),
    })?;

    let mut index = 0;
    for segment in macho.segments.iter() {
        let sections = segment.sections().map_err(|e| Error::InvalidArtifact {
            reason: e.to_string(),
        })?;
        for (section, _) in sections {
            index += 1;
            let end = section.addr.saturating_add(section.size);
            if section.offset != 0 && address >= section.addr && address < end {
                return Ok(SymbolLocation {
                    section: index,
                    file_offset: section.offset as u64 + (address - section.addr),
                });
            }
        }
    }

    Err(Error::InvalidArtifact {
        reason: format!("'{}' at {:#x} is not inside a file-backed section", symbol, address),
    })
}

fn locate_elf(elf: &Elf<'_>, symbol: &str) -> Result<SymbolLocation> {
    let sym = elf
        .syms
        .iter()
        .find(|s| s.st_shndx != 0 && elf.strtab.get_at(s.st_name) == Some(symbol))
        .ok_or_else(|| Error::BlobSymbolNotFound {
            symbol: symbol.to_string(),
        })?;

    let header = elf
        .section_headers
        .get(sym.st_shndx)
        .filter(|h| sym.st_value >= h.sh_addr)
        .ok_or_else(|| Error::InvalidArtifact {
            reason: format!("'{}' has no usable section", symbol),
        })?;

    Ok(SymbolLocation {
        section: sym.st_shndx,
        file_offset: header.sh_offset + (sym.st_value - header.sh_addr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_adjacent_blobs() {
        let mut image = BinaryImage::from_bytes(vec![0u8; 0x100]);
        let blobs = vec![
            InjectionBlob::new("a", 0x10, vec![0xAA; 0x10], 0x20),
            InjectionBlob::new("b", 0x20, vec![0xBB; 0x8], 0x20),
        ];

        assert_eq!(place_blobs(&mut image, &blobs).unwrap(), 0x18);
        assert_eq!(image.as_bytes()[0x1F], 0xAA);
        assert_eq!(image.as_bytes()[0x20], 0xBB);
        assert_eq!(image.as_bytes()[0x28], 0x00);
    }

    #[test]
    fn test_overlap_rejected_before_any_write() {
        let mut image = BinaryImage::from_bytes(vec![0u8; 0x100]);
        let before = image.as_bytes().to_vec();
        let blobs = vec![
            InjectionBlob::new("a", 0x10, vec![0xAA; 0x10], 0x20),
            InjectionBlob::new("b", 0x1F, vec![0xBB; 0x8], 0x20),
        ];

        assert!(matches!(
            place_blobs(&mut image, &blobs),
            Err(Error::InjectionOverlap { .. })
        ));
        assert_eq!(image.as_bytes(), before.as_slice());
        assert!(!image.is_dirty());
    }

    #[test]
    fn test_size_limits() {
        let mut image = BinaryImage::from_bytes(vec![0u8; 0x1000]);

        let too_big = [InjectionBlob::new("big", 0, vec![0x90; 401], 400)];
        assert!(matches!(
            place_blobs(&mut image, &too_big),
            Err(Error::InjectionSizeExceeded { size: 401, max: 400, .. })
        ));

        let empty = [InjectionBlob::new("empty", 0, vec![], 400)];
        assert!(matches!(
            place_blobs(&mut image, &empty),
            Err(Error::EmptyInjection { .. })
        ));
        assert!(!image.is_dirty());
    }

    #[test]
    fn test_out_of_bounds_blob() {
        let mut image = BinaryImage::from_bytes(vec![0u8; 0x100]);
        let blobs = [
            InjectionBlob::new("ok", 0x0, vec![1; 4], 400),
            InjectionBlob::new("tail", 0xFE, vec![1; 4], 400),
        ];

        assert!(matches!(
            place_blobs(&mut image, &blobs),
            Err(Error::SiteOutOfBounds { .. })
        ));
        assert!(image.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let err = extract_blob(&[0u8; 64], "hp_cutoff", "hp_cutoff_end").unwrap_err();
        assert!(matches!(err, Error::InvalidArtifact { .. }));
    }
}

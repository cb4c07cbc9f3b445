//! Concrete patch and injection sites.

use std::fmt;

use super::known::{InjectionSiteKind, KnownPatch};
use crate::error::{Error, Result};
use crate::macho::Arch;

/// Where a site's replacement bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteOrigin {
    /// A known patch with canonical bytes
    Known(KnownPatch),
    /// A guarded document-supplied pair (original + replacement)
    Document,
}

/// A fixed-length byte substitution at an absolute file offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSite {
    /// Site name
    pub name: String,
    /// Architecture slice the site lives in
    pub arch: Arch,
    /// Absolute file offset
    pub offset: u64,
    /// Bytes expected before patching, if known
    pub expected: Option<Vec<u8>>,
    /// Bytes written by the patch
    pub replacement: Vec<u8>,
    /// Source of the replacement bytes
    pub origin: SiteOrigin,
}

impl PatchSite {
    /// Creates a site, enforcing that the patch never changes the file length.
    pub fn new(
        name: impl Into<String>,
        arch: Arch,
        offset: u64,
        expected: Option<Vec<u8>>,
        replacement: Vec<u8>,
        origin: SiteOrigin,
    ) -> Result<Self> {
        let name = name.into();
        if replacement.is_empty() {
            return Err(Error::EmptyPatch { name });
        }
        if let Some(ref original) = expected {
            if original.len() != replacement.len() {
                return Err(Error::LengthMismatch {
                    name,
                    original: original.len(),
                    replacement: replacement.len(),
                });
            }
        }
        Ok(Self {
            name,
            arch,
            offset,
            expected,
            replacement,
            origin,
        })
    }

    /// Creates a site for a known patch using its canonical bytes.
    pub fn known(
        patch: KnownPatch,
        arch: Arch,
        offset: u64,
        expected: Option<Vec<u8>>,
    ) -> Result<Self> {
        Self::new(
            patch.name(),
            arch,
            offset,
            expected,
            patch.replacement().to_vec(),
            SiteOrigin::Known(patch),
        )
    }

    /// Returns the patch length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.replacement.len()
    }

    /// Returns true if the site has no bytes (never the case for a valid site).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.replacement.is_empty()
    }

    /// Returns the end offset (exclusive).
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len() as u64)
    }

    /// Returns the name qualified by architecture for display.
    pub fn display_name(&self) -> String {
        match self.arch {
            Arch::X86_64 => self.name.clone(),
            Arch::Arm64 => format!("ARM64:{}", self.name),
            other => format!("{}:{}", other, self.name),
        }
    }
}

impl fmt::Display for PatchSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:#x}", self.display_name(), self.offset)
    }
}

/// A reserved code cave that receives an injection blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionSite {
    /// Which function goes here
    pub kind: InjectionSiteKind,
    /// Architecture slice of the cave
    pub arch: Arch,
    /// Absolute file offset
    pub offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_invariant() {
        let err = PatchSite::new(
            "bad",
            Arch::X86_64,
            0,
            Some(vec![1, 2]),
            vec![3],
            SiteOrigin::Document,
        )
        .unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { .. }));

        assert!(matches!(
            PatchSite::new("empty", Arch::X86_64, 0, None, vec![], SiteOrigin::Document),
            Err(Error::EmptyPatch { .. })
        ));
    }

    #[test]
    fn test_known_site() {
        let site = PatchSite::known(KnownPatch::HighPassFilter, Arch::X86_64, 0x2B6EC0, None)
            .unwrap();
        assert_eq!(site.replacement, vec![0xC3]);
        assert_eq!(site.end(), 0x2B6EC1);
        assert_eq!(site.to_string(), "HighPassFilter @ 0x2b6ec0");
    }

    #[test]
    fn test_display_name() {
        let site = PatchSite::new(
            "stereo_a",
            Arch::Arm64,
            0x10,
            Some(vec![0x20]),
            vec![0x40],
            SiteOrigin::Document,
        )
        .unwrap();
        assert_eq!(site.display_name(), "ARM64:stereo_a");
    }
}

//! Patch status classification.
//!
//! Compares the current image against a resolved site list and reduces the
//! per-site results to a single file status. Nothing here mutates the image.

use std::fmt;

use crate::image::BinaryImage;
use crate::macho::Arch;
use crate::patch::{classify_site, PatchSite};

/// Status of one patch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStatus {
    /// Site holds the replacement bytes
    Patched,
    /// Site holds the expected original bytes
    Unpatched,
    /// Anything else, including an out-of-range site
    Other,
}

impl SiteStatus {
    /// Returns a lowercase label.
    pub fn name(&self) -> &'static str {
        match self {
            SiteStatus::Patched => "patched",
            SiteStatus::Unpatched => "unpatched",
            SiteStatus::Other => "other",
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Aggregate status of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Every site is patched
    Patched,
    /// Every site is unpatched
    Unpatched,
    /// Mixed results
    Partial,
    /// No sites to judge by
    Other,
}

impl FileStatus {
    /// Returns an uppercase label.
    pub fn name(&self) -> &'static str {
        match self {
            FileStatus::Patched => "PATCHED",
            FileStatus::Unpatched => "UNPATCHED",
            FileStatus::Partial => "PARTIAL",
            FileStatus::Other => "OTHER",
        }
    }

    /// Reduces per-site statuses to a file status.
    pub fn aggregate<I: IntoIterator<Item = SiteStatus>>(statuses: I) -> Self {
        let mut total = 0usize;
        let mut patched = 0usize;
        let mut unpatched = 0usize;
        for status in statuses {
            total += 1;
            match status {
                SiteStatus::Patched => patched += 1,
                SiteStatus::Unpatched => unpatched += 1,
                SiteStatus::Other => {}
            }
        }

        if total == 0 {
            FileStatus::Other
        } else if patched == total {
            FileStatus::Patched
        } else if unpatched == total {
            FileStatus::Unpatched
        } else {
            FileStatus::Partial
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classification of one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteReport {
    /// Display name of the site
    pub name: String,
    /// Architecture slice
    pub arch: Arch,
    /// Absolute file offset
    pub offset: u64,
    /// Result
    pub status: SiteStatus,
}

/// Classification of a whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Aggregate status
    pub status: FileStatus,
    /// Per-site detail, in site order
    pub sites: Vec<SiteReport>,
}

impl StatusReport {
    /// Number of patched sites.
    pub fn patched(&self) -> usize {
        self.count(SiteStatus::Patched)
    }

    /// Number of unpatched sites.
    pub fn unpatched(&self) -> usize {
        self.count(SiteStatus::Unpatched)
    }

    /// Number of sites with unexpected content.
    pub fn other(&self) -> usize {
        self.count(SiteStatus::Other)
    }

    /// Returns true if the per-site detail is worth printing.
    pub fn is_mixed(&self) -> bool {
        matches!(self.status, FileStatus::Partial)
    }

    fn count(&self, status: SiteStatus) -> usize {
        self.sites.iter().filter(|s| s.status == status).count()
    }
}

/// Classifies every site against the image.
pub fn classify(image: &BinaryImage, sites: &[PatchSite]) -> StatusReport {
    let sites: Vec<SiteReport> = sites
        .iter()
        .map(|site| SiteReport {
            name: site.display_name(),
            arch: site.arch,
            offset: site.offset,
            status: classify_site(image, site),
        })
        .collect();

    StatusReport {
        status: FileStatus::aggregate(sites.iter().map(|s| s.status)),
        sites,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::SiteOrigin;

    fn site(offset: u64, expected: u8, replacement: u8) -> PatchSite {
        PatchSite::new(
            format!("site_{:x}", offset),
            Arch::X86_64,
            offset,
            Some(vec![expected]),
            vec![replacement],
            SiteOrigin::Document,
        )
        .unwrap()
    }

    #[test]
    fn test_aggregate() {
        use SiteStatus::*;
        assert_eq!(FileStatus::aggregate([]), FileStatus::Other);
        assert_eq!(FileStatus::aggregate([Patched, Patched]), FileStatus::Patched);
        assert_eq!(FileStatus::aggregate([Unpatched]), FileStatus::Unpatched);
        assert_eq!(FileStatus::aggregate([Patched, Unpatched]), FileStatus::Partial);
        assert_eq!(FileStatus::aggregate([Other, Other]), FileStatus::Partial);
    }

    #[test]
    fn test_classify_mixed_file() {
        let mut data = vec![0u8; 0x40];
        data[0x10] = 0x01;
        data[0x20] = 0x02;
        data[0x30] = 0x7F;
        let image = BinaryImage::from_bytes(data);
        let sites = [site(0x10, 0x01, 0x02), site(0x20, 0x01, 0x02), site(0x30, 0x01, 0x02)];

        let report = classify(&image, &sites);
        assert_eq!(report.status, FileStatus::Partial);
        assert_eq!(report.unpatched(), 1);
        assert_eq!(report.patched(), 1);
        assert_eq!(report.other(), 1);
        assert!(report.is_mixed());
    }

    #[test]
    fn test_classify_no_sites() {
        let image = BinaryImage::from_bytes(vec![0u8; 0x10]);
        let report = classify(&image, &[]);
        assert_eq!(report.status, FileStatus::Other);
        assert!(report.sites.is_empty());
    }
}

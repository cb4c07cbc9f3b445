//! Byte patch application and verification.

use tracing::{debug, info, warn};

use super::site::PatchSite;
use crate::error::{Error, Result};
use crate::image::BinaryImage;
use crate::status::SiteStatus;
use crate::util::to_hex;

/// Successful result of applying one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Bytes were written and verified
    Applied,
    /// The site already held the replacement; nothing was written
    AlreadyApplied,
}

/// Applies one site to the image.
///
/// Applying a site twice is safe: the second call finds the replacement in
/// place and reports [`ApplyOutcome::AlreadyApplied`]. A site with expected
/// original bytes is only written over those bytes: any other content fails
/// with [`Error::UnexpectedContent`] and the site is left as it was, rather
/// than being overwritten. Sites without expected bytes are written over
/// whatever they hold.
pub fn apply_site(image: &mut BinaryImage, site: &PatchSite) -> Result<ApplyOutcome> {
    let current = image.read_checked(&site.name, site.offset, site.len())?;

    if current == site.replacement.as_slice() {
        return Ok(ApplyOutcome::AlreadyApplied);
    }

    if let Some(ref expected) = site.expected {
        if current != expected.as_slice() {
            return Err(Error::UnexpectedContent {
                name: site.display_name(),
                offset: site.offset,
                expected: to_hex(expected),
                actual: to_hex(current),
            });
        }
    }

    image.write(&site.name, site.offset, &site.replacement)?;

    let written = image.read_checked(&site.name, site.offset, site.len())?;
    if written != site.replacement.as_slice() {
        return Err(Error::VerificationMismatch {
            name: site.display_name(),
            offset: site.offset,
            expected: to_hex(&site.replacement),
            actual: to_hex(written),
        });
    }

    Ok(ApplyOutcome::Applied)
}

/// Classifies one site against the image.
pub fn classify_site(image: &BinaryImage, site: &PatchSite) -> SiteStatus {
    let Some(current) = image.read(site.offset, site.len()) else {
        return SiteStatus::Other;
    };

    if current == site.replacement.as_slice() {
        SiteStatus::Patched
    } else if site.expected.as_deref() == Some(current) {
        SiteStatus::Unpatched
    } else {
        SiteStatus::Other
    }
}

/// Result of applying one site within a batch.
#[derive(Debug)]
pub struct SiteResult {
    /// The site
    pub site: PatchSite,
    /// Outcome or failure
    pub result: Result<ApplyOutcome>,
}

impl SiteResult {
    /// Returns true if the site now holds its replacement.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Results of a batch of byte patches.
#[derive(Debug, Default)]
pub struct PatchReport {
    /// Per-site results in application order
    pub results: Vec<SiteResult>,
}

impl PatchReport {
    /// Number of sites written in this batch.
    pub fn applied(&self) -> usize {
        self.count(|r| matches!(r, Ok(ApplyOutcome::Applied)))
    }

    /// Number of sites that were already patched.
    pub fn already_applied(&self) -> usize {
        self.count(|r| matches!(r, Ok(ApplyOutcome::AlreadyApplied)))
    }

    /// Number of failed sites.
    pub fn failed(&self) -> usize {
        self.count(|r| r.is_err())
    }

    /// Returns the sites that hold their replacement after the batch.
    pub fn successful_sites(&self) -> impl Iterator<Item = &PatchSite> {
        self.results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| &r.site)
    }

    /// Marks a previously successful site as failed.
    pub fn mark_failed(&mut self, index: usize, error: Error) {
        if let Some(entry) = self.results.get_mut(index) {
            entry.result = Err(error);
        }
    }

    fn count(&self, pred: impl Fn(&Result<ApplyOutcome>) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.result)).count()
    }
}

/// Applies every site, recording failures without stopping.
///
/// A site written by the batch is recorded with the bytes it replaced as its
/// expected original, so the report can later tell an unpatched site apart.
/// `progress` is called after each site with its index.
pub fn apply_sites<F>(image: &mut BinaryImage, sites: &[PatchSite], mut progress: F) -> PatchReport
where
    F: FnMut(usize, &PatchSite),
{
    let mut report = PatchReport::default();

    for (i, site) in sites.iter().enumerate() {
        let before = image.read(site.offset, site.len()).map(<[u8]>::to_vec);
        let result = apply_site(image, site);

        let mut recorded = site.clone();
        match &result {
            Ok(ApplyOutcome::Applied) => {
                info!("  [OK] {}", site);
                if recorded.expected.is_none() {
                    recorded.expected = before;
                }
            }
            Ok(ApplyOutcome::AlreadyApplied) => debug!("  {}: already patched", site),
            Err(e) => warn!("  [FAIL] {}: {}", site, e),
        }
        report.results.push(SiteResult {
            site: recorded,
            result,
        });
        progress(i, site);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::Arch;
    use crate::patch::SiteOrigin;

    fn one_byte_site(offset: u64, expected: Option<u8>, replacement: u8) -> PatchSite {
        PatchSite::new(
            "site",
            Arch::X86_64,
            offset,
            expected.map(|b| vec![b]),
            vec![replacement],
            SiteOrigin::Document,
        )
        .unwrap()
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut image = BinaryImage::from_bytes(vec![0x01; 0x100]);
        let site = one_byte_site(0x10, Some(0x01), 0x02);

        assert_eq!(apply_site(&mut image, &site).unwrap(), ApplyOutcome::Applied);
        let once = image.as_bytes().to_vec();
        assert_eq!(apply_site(&mut image, &site).unwrap(), ApplyOutcome::AlreadyApplied);
        assert_eq!(image.as_bytes(), once.as_slice());
    }

    #[test]
    fn test_round_trip_classification() {
        let mut image = BinaryImage::from_bytes(vec![0x01; 0x100]);
        let site = one_byte_site(0x10, Some(0x01), 0x02);

        apply_site(&mut image, &site).unwrap();
        assert_eq!(classify_site(&image, &site), SiteStatus::Patched);

        image.write("restore", 0x10, &[0x01]).unwrap();
        assert_eq!(classify_site(&image, &site), SiteStatus::Unpatched);
    }

    #[test]
    fn test_out_of_bounds_site() {
        let mut image = BinaryImage::from_bytes(vec![0u8; 0x10]);
        let site = PatchSite::new(
            "tail",
            Arch::X86_64,
            0x0E,
            None,
            vec![1, 2, 3],
            SiteOrigin::Document,
        )
        .unwrap();

        assert_eq!(classify_site(&image, &site), SiteStatus::Other);
        assert!(matches!(
            apply_site(&mut image, &site),
            Err(Error::SiteOutOfBounds { .. })
        ));
        assert!(image.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unexpected_content_is_not_written() {
        let mut image = BinaryImage::from_bytes(vec![0x55; 0x10]);
        let site = one_byte_site(0x4, Some(0x01), 0x02);

        assert!(matches!(
            apply_site(&mut image, &site),
            Err(Error::UnexpectedContent { .. })
        ));
        assert_eq!(image.as_bytes()[0x4], 0x55);
        assert!(!image.is_dirty());
    }

    #[test]
    fn test_unguarded_site_overwrites() {
        let mut image = BinaryImage::from_bytes(vec![0x55; 0x10]);
        let site = one_byte_site(0x4, None, 0xC3);

        assert_eq!(apply_site(&mut image, &site).unwrap(), ApplyOutcome::Applied);
        assert_eq!(image.as_bytes()[0x4], 0xC3);
    }

    #[test]
    fn test_batch_continues_after_failure() {
        let mut image = BinaryImage::from_bytes(vec![0x01; 0x20]);
        let sites = vec![
            one_byte_site(0x40, Some(0x01), 0x02),
            one_byte_site(0x10, Some(0x01), 0x02),
            one_byte_site(0x11, Some(0x01), 0x01),
        ];
        let mut seen = Vec::new();
        let report = apply_sites(&mut image, &sites, |i, _| seen.push(i));

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.applied(), 1);
        assert_eq!(report.already_applied(), 1);
        assert_eq!(report.successful_sites().count(), 2);
        assert_eq!(image.as_bytes()[0x10], 0x02);
    }

    #[test]
    fn test_batch_records_replaced_bytes() {
        let mut image = BinaryImage::from_bytes(vec![0x55; 0x20]);
        image.write("prep", 0x8, &[0xC3]).unwrap();
        let sites = vec![one_byte_site(0x4, None, 0xC3), one_byte_site(0x8, None, 0xC3)];
        let report = apply_sites(&mut image, &sites, |_, _| {});

        let recorded: Vec<_> = report.successful_sites().map(|s| s.expected.clone()).collect();
        assert_eq!(recorded, vec![Some(vec![0x55]), None]);
    }

    #[test]
    fn test_end_to_end_single_byte() {
        let mut data = vec![0u8; 0x2000];
        data[0x100] = 0x01;
        let mut image = BinaryImage::from_bytes(data);
        let site = one_byte_site(0x100, Some(0x01), 0x02);
        let before = image.as_bytes().to_vec();

        assert_eq!(classify_site(&image, &site), SiteStatus::Unpatched);

        assert_eq!(apply_site(&mut image, &site).unwrap(), ApplyOutcome::Applied);
        let changed: Vec<usize> = (0..before.len())
            .filter(|&i| before[i] != image.as_bytes()[i])
            .collect();
        assert_eq!(changed, vec![0x100]);

        assert_eq!(classify_site(&image, &site), SiteStatus::Patched);
        assert_eq!(apply_site(&mut image, &site).unwrap(), ApplyOutcome::AlreadyApplied);

        image.write("corrupt", 0x100, &[0xFF]).unwrap();
        assert_eq!(classify_site(&image, &site), SiteStatus::Other);
    }
}

//! Slice shift resolution.
//!
//! Offsets recorded against an earlier on-disk layout drift when a tool
//! rewrites the container (stripping a code signature shrinks slices and moves
//! later slices towards the header). A record that carries both its absolute
//! offset and its slice-relative offset pins the slice base that was in effect
//! when it was recorded; the difference to the current base is the shift.

use std::fmt;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::macho::Arch;
use crate::util::shift_offset;

/// How a shift value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftSource {
    /// Measured from a dual-offset record and the current slice table
    Measured,
    /// No usable data; zero assumed
    Assumed,
}

/// Offset correction for one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceShift {
    /// Architecture
    pub arch: Arch,
    /// Slice base implied by the recorded offsets
    pub recorded_base: Option<u64>,
    /// Slice base in the current file
    pub current_base: Option<u64>,
    /// Signed correction added to recorded offsets
    pub delta: i64,
    /// Whether the delta was measured or assumed
    pub source: ShiftSource,
}

impl SliceShift {
    /// Returns a zero shift marked as assumed.
    pub fn assumed(arch: Arch, current_base: Option<u64>) -> Self {
        Self {
            arch,
            recorded_base: None,
            current_base,
            delta: 0,
            source: ShiftSource::Assumed,
        }
    }

    /// Resolves the shift for `arch` from `(recorded_offset, slice_offset)`
    /// records.
    ///
    /// The first record whose recorded offset is at least its slice offset
    /// fixes the recorded base. Without such a record, or without a current
    /// base, the shift is zero and marked [`ShiftSource::Assumed`].
    pub fn resolve<I>(arch: Arch, records: I, current_base: Option<u64>) -> Self
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let recorded_base = records
            .into_iter()
            .find(|&(recorded, va)| recorded >= va)
            .map(|(recorded, va)| recorded - va);

        let (Some(recorded), Some(current)) = (recorded_base, current_base) else {
            if recorded_base.is_none() {
                warn!(
                    "{}: no dual-offset record, assuming slice has not moved",
                    arch
                );
            } else {
                warn!("{}: slice not present in current file, shift unknown", arch);
            }
            return Self {
                recorded_base,
                ..Self::assumed(arch, current_base)
            };
        };

        let delta = (current as i128 - recorded as i128).clamp(i64::MIN as i128, i64::MAX as i128)
            as i64;
        if delta != 0 {
            info!(
                "{} slice shifted by {:+} bytes ({:#x} -> {:#x})",
                arch, delta, recorded, current
            );
        }

        Self {
            arch,
            recorded_base: Some(recorded),
            current_base: Some(current),
            delta,
            source: ShiftSource::Measured,
        }
    }

    /// Returns true if the slice moved.
    #[inline]
    pub fn is_shifted(&self) -> bool {
        self.delta != 0
    }

    /// Maps a recorded absolute offset onto the current layout.
    pub fn apply(&self, recorded: u64) -> Result<u64> {
        shift_offset(recorded, self.delta).ok_or(Error::OffsetUnderflow {
            offset: recorded,
            shift: self.delta,
        })
    }
}

impl fmt::Display for SliceShift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:+}", self.arch, self.delta)?;
        if self.source == ShiftSource::Assumed {
            f.write_str(" (assumed)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measured_shift() {
        // Recorded against a slice at 0x8000, the slice now sits at 0x7000.
        let shift = SliceShift::resolve(Arch::Arm64, [(0x8123, 0x123)], Some(0x7000));

        assert_eq!(shift.source, ShiftSource::Measured);
        assert_eq!(shift.recorded_base, Some(0x8000));
        assert_eq!(shift.delta, -0x1000);
        assert_eq!(shift.apply(0x8456).unwrap(), 0x7456);
    }

    #[test]
    fn test_shift_invariance() {
        // Two layouts differing only in slice base.
        let va = 0x2345;
        let old_base = 0x10_0000;
        let new_base = 0x0F_C000;
        let recorded = old_base + va;

        let shift = SliceShift::resolve(Arch::Arm64, [(recorded, va)], Some(new_base));
        assert_eq!(shift.apply(recorded).unwrap(), new_base + va);

        // A stale absolute offset with no dual record is not corrected.
        let stale = SliceShift::resolve(Arch::Arm64, std::iter::empty(), Some(new_base));
        assert_eq!(stale.source, ShiftSource::Assumed);
        assert_ne!(stale.apply(recorded).unwrap(), new_base + va);
    }

    #[test]
    fn test_records_below_slice_offset_are_skipped() {
        let shift = SliceShift::resolve(Arch::X86_64, [(0x10, 0x20), (0x1020, 0x20)], Some(0x1000));
        assert_eq!(shift.recorded_base, Some(0x1000));
        assert_eq!(shift.delta, 0);
        assert!(!shift.is_shifted());
    }

    #[test]
    fn test_missing_current_base() {
        let shift = SliceShift::resolve(Arch::Arm64, [(0x8100, 0x100)], None);
        assert_eq!(shift.source, ShiftSource::Assumed);
        assert_eq!(shift.delta, 0);
        assert_eq!(shift.recorded_base, Some(0x8000));
    }

    #[test]
    fn test_underflow() {
        let shift = SliceShift::resolve(Arch::Arm64, [(0x9000, 0x0)], Some(0x1000));
        assert!(matches!(shift.apply(0x10), Err(Error::OffsetUnderflow { .. })));
        assert_eq!(shift.to_string(), "arm64: -32768");
    }
}

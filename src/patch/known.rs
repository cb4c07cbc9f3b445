//! Closed table of recognized patch sites.
//!
//! Every byte patch the engine is willing to write under a known name is listed
//! here together with its canonical replacement bytes. Names coming from a
//! discovery document or from persisted metadata are mapped onto this table;
//! their own byte payloads are never trusted for a known name.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum size of a single injection blob, in bytes.
pub const MAX_INJECTION_SIZE: usize = 400;

/// Functional group a patch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchCategory {
    /// Channel count and stereo path
    Stereo,
    /// Bitrate ceiling
    Bitrate,
    /// Filters and checks disabled with an early return
    Filter,
    /// Encoder configuration defaults
    Encoder,
    /// SDP negotiation
    Sdp,
}

impl PatchCategory {
    /// Returns a display name.
    pub fn name(&self) -> &'static str {
        match self {
            PatchCategory::Stereo => "Stereo",
            PatchCategory::Bitrate => "Bitrate",
            PatchCategory::Filter => "Filter",
            PatchCategory::Encoder => "Encoder",
            PatchCategory::Sdp => "SDP",
        }
    }
}

/// Known x86_64 patch sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum KnownPatch {
    EmulateStereoSuccess1,
    EmulateStereoSuccess2,
    CreateAudioFrameStereo,
    AudioEncoderOpusConfigSetChannels,
    MonoDownmixer,
    EmulateBitrateModified,
    SetsBitrateBitrateValue,
    SetsBitrateBitwiseOr,
    DuplicateEmulateBitrateModified,
    HighPassFilter,
    DownmixFunc,
    AudioEncoderOpusConfigIsOk,
    ThrowError,
    EncoderConfigInit1,
    EncoderConfigInit2,
    SdpStereoForce1,
    SdpStereoForce2,
}

impl KnownPatch {
    /// All known patches in application order.
    pub const ALL: [KnownPatch; 17] = [
        KnownPatch::EmulateStereoSuccess1,
        KnownPatch::EmulateStereoSuccess2,
        KnownPatch::CreateAudioFrameStereo,
        KnownPatch::AudioEncoderOpusConfigSetChannels,
        KnownPatch::MonoDownmixer,
        KnownPatch::EmulateBitrateModified,
        KnownPatch::SetsBitrateBitrateValue,
        KnownPatch::SetsBitrateBitwiseOr,
        KnownPatch::DuplicateEmulateBitrateModified,
        KnownPatch::HighPassFilter,
        KnownPatch::DownmixFunc,
        KnownPatch::AudioEncoderOpusConfigIsOk,
        KnownPatch::ThrowError,
        KnownPatch::EncoderConfigInit1,
        KnownPatch::EncoderConfigInit2,
        KnownPatch::SdpStereoForce1,
        KnownPatch::SdpStereoForce2,
    ];

    /// Returns the name used by the offset finder.
    pub fn name(&self) -> &'static str {
        match self {
            KnownPatch::EmulateStereoSuccess1 => "EmulateStereoSuccess1",
            KnownPatch::EmulateStereoSuccess2 => "EmulateStereoSuccess2",
            KnownPatch::CreateAudioFrameStereo => "CreateAudioFrameStereo",
            KnownPatch::AudioEncoderOpusConfigSetChannels => "AudioEncoderOpusConfigSetChannels",
            KnownPatch::MonoDownmixer => "MonoDownmixer",
            KnownPatch::EmulateBitrateModified => "EmulateBitrateModified",
            KnownPatch::SetsBitrateBitrateValue => "SetsBitrateBitrateValue",
            KnownPatch::SetsBitrateBitwiseOr => "SetsBitrateBitwiseOr",
            KnownPatch::DuplicateEmulateBitrateModified => "DuplicateEmulateBitrateModified",
            KnownPatch::HighPassFilter => "HighPassFilter",
            KnownPatch::DownmixFunc => "DownmixFunc",
            KnownPatch::AudioEncoderOpusConfigIsOk => "AudioEncoderOpusConfigIsOk",
            KnownPatch::ThrowError => "ThrowError",
            KnownPatch::EncoderConfigInit1 => "EncoderConfigInit1",
            KnownPatch::EncoderConfigInit2 => "EncoderConfigInit2",
            KnownPatch::SdpStereoForce1 => "SDPStereoForce1",
            KnownPatch::SdpStereoForce2 => "SDPStereoForce2",
        }
    }

    /// Looks up a patch by finder name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }

    /// Returns the canonical replacement bytes (384 kbps stereo profile).
    pub fn replacement(&self) -> &'static [u8] {
        match self {
            KnownPatch::EmulateStereoSuccess1 => &[0x02],
            // jne -> jmp
            KnownPatch::EmulateStereoSuccess2 => &[0xEB],
            KnownPatch::CreateAudioFrameStereo => &[0x49, 0x89, 0xC4, 0x90],
            KnownPatch::AudioEncoderOpusConfigSetChannels => &[0x02],
            // NOP sled + jmp
            KnownPatch::MonoDownmixer => &[
                0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xE9,
            ],
            // 384000 = 0x05DC00
            KnownPatch::EmulateBitrateModified => &[0x00, 0xDC, 0x05],
            KnownPatch::SetsBitrateBitrateValue => &[0x00, 0xDC, 0x05, 0x00, 0x00],
            KnownPatch::SetsBitrateBitwiseOr => &[0x90, 0x90, 0x90],
            KnownPatch::DuplicateEmulateBitrateModified => &[0x00, 0xDC, 0x05],
            KnownPatch::HighPassFilter
            | KnownPatch::DownmixFunc
            | KnownPatch::AudioEncoderOpusConfigIsOk
            | KnownPatch::ThrowError => &[0xC3],
            KnownPatch::EncoderConfigInit1 | KnownPatch::EncoderConfigInit2 => {
                &[0x00, 0xDC, 0x05, 0x00]
            }
            KnownPatch::SdpStereoForce1 | KnownPatch::SdpStereoForce2 => &[0x48, 0x89, 0xC2, 0x90],
        }
    }

    /// Returns the functional group.
    pub fn category(&self) -> PatchCategory {
        match self {
            KnownPatch::EmulateStereoSuccess1
            | KnownPatch::EmulateStereoSuccess2
            | KnownPatch::CreateAudioFrameStereo
            | KnownPatch::AudioEncoderOpusConfigSetChannels
            | KnownPatch::MonoDownmixer => PatchCategory::Stereo,
            KnownPatch::EmulateBitrateModified
            | KnownPatch::SetsBitrateBitrateValue
            | KnownPatch::SetsBitrateBitwiseOr
            | KnownPatch::DuplicateEmulateBitrateModified => PatchCategory::Bitrate,
            KnownPatch::HighPassFilter
            | KnownPatch::DownmixFunc
            | KnownPatch::AudioEncoderOpusConfigIsOk
            | KnownPatch::ThrowError => PatchCategory::Filter,
            KnownPatch::EncoderConfigInit1 | KnownPatch::EncoderConfigInit2 => {
                PatchCategory::Encoder
            }
            KnownPatch::SdpStereoForce1 | KnownPatch::SdpStereoForce2 => PatchCategory::Sdp,
        }
    }
}

impl fmt::Display for KnownPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KnownPatch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        KnownPatch::from_name(s).ok_or_else(|| Error::UnknownPatch(s.to_string()))
    }
}

/// Reserved code caves that receive injected replacement functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InjectionSiteKind {
    /// Replacement for the high-pass cutoff filter
    HighpassCutoffFilter,
    /// Replacement for the DC rejection filter
    DcReject,
}

impl InjectionSiteKind {
    /// All injection sites, in placement order.
    pub const ALL: [InjectionSiteKind; 2] =
        [InjectionSiteKind::HighpassCutoffFilter, InjectionSiteKind::DcReject];

    /// Returns the name used by the offset finder.
    pub fn name(&self) -> &'static str {
        match self {
            InjectionSiteKind::HighpassCutoffFilter => "HighpassCutoffFilter",
            InjectionSiteKind::DcReject => "DcReject",
        }
    }

    /// Looks up an injection site by finder name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Returns the (start, end-marker) symbols delimiting the compiled function.
    pub fn symbols(&self) -> (&'static str, &'static str) {
        match self {
            InjectionSiteKind::HighpassCutoffFilter => ("hp_cutoff", "hp_cutoff_end"),
            InjectionSiteKind::DcReject => ("dc_reject", "dc_reject_end"),
        }
    }
}

impl fmt::Display for InjectionSiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for patch in KnownPatch::ALL {
            assert_eq!(KnownPatch::from_name(patch.name()), Some(patch));
        }
        assert_eq!(KnownPatch::from_name("NotAPatch"), None);
        assert!("NotAPatch".parse::<KnownPatch>().is_err());
    }

    #[test]
    fn test_replacements_are_non_empty() {
        for patch in KnownPatch::ALL {
            assert!(!patch.replacement().is_empty(), "{}", patch);
        }
        assert_eq!(KnownPatch::MonoDownmixer.replacement().len(), 13);
        assert_eq!(KnownPatch::SdpStereoForce1.name(), "SDPStereoForce1");
        assert_eq!(KnownPatch::ThrowError.category(), PatchCategory::Filter);
    }

    #[test]
    fn test_injection_sites() {
        assert_eq!(
            InjectionSiteKind::from_name("DcReject"),
            Some(InjectionSiteKind::DcReject)
        );
        assert_eq!(InjectionSiteKind::from_name("Other"), None);
        assert_eq!(
            InjectionSiteKind::HighpassCutoffFilter.symbols(),
            ("hp_cutoff", "hp_cutoff_end")
        );
    }
}

//! Discovery documents and the external offset finder.
//!
//! The offset finder is an external program that analyses the target and
//! exports a JSON document naming patch sites and injection caves. This module
//! models that document, runs the finder with a bounded wait, and provides the
//! fixed-offset table for the one module build whose offsets are known ahead of
//! time.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::patch::{InjectionSiteKind, KnownPatch};
use crate::util::parse_offset;

// =============================================================================
// Document Model
// =============================================================================

/// An offset that arrives either as an integer or as a hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OffsetValue {
    /// Plain integer
    Int(u64),
    /// Hex string, with or without `0x`
    Hex(String),
}

impl OffsetValue {
    /// Returns the numeric offset.
    pub fn value(&self) -> Result<u64> {
        match self {
            OffsetValue::Int(v) => Ok(*v),
            OffsetValue::Hex(s) => parse_offset(s),
        }
    }
}

impl From<u64> for OffsetValue {
    fn from(v: u64) -> Self {
        OffsetValue::Int(v)
    }
}

/// Entry of the `patches` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPatch {
    /// Patch name
    #[serde(default)]
    pub name: Option<String>,
    /// Absolute file offset
    #[serde(default)]
    pub file_offset: Option<OffsetValue>,
    /// Original bytes at the site, as hex
    #[serde(default)]
    pub expected_original: Option<String>,
    /// Offset from the start of the x86_64 slice (not a virtual address),
    /// used to correct `file_offset` for slice shifts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub va: Option<OffsetValue>,
}

/// Entry of the `stereo_patches` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StereoPatch {
    /// Architecture tag ("x86_64" or "arm64")
    #[serde(default)]
    pub arch: Option<String>,
    /// Absolute file offset at discovery time
    #[serde(default)]
    pub fat_offset: Option<OffsetValue>,
    /// Offset relative to the slice base
    #[serde(default)]
    pub va: Option<OffsetValue>,
    /// Original bytes, as hex
    #[serde(default)]
    pub orig: Option<String>,
    /// Replacement bytes, as hex
    #[serde(default)]
    pub patch: Option<String>,
    /// Patch name
    #[serde(default)]
    pub name: Option<String>,
}

/// Entry of the `injection_sites` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredInjectionSite {
    /// Site name
    #[serde(default)]
    pub name: Option<String>,
    /// Absolute file offset
    #[serde(default)]
    pub file_offset: Option<OffsetValue>,
    /// Architecture tag, x86_64 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

/// Output of the offset finder.
///
/// Every field is optional; missing and `null` fields read as empty and
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Named patches
    #[serde(default, deserialize_with = "nullable")]
    pub patches: Vec<DiscoveredPatch>,
    /// Flat name -> offset table
    #[serde(default, deserialize_with = "nullable")]
    pub file_offsets: BTreeMap<String, OffsetValue>,
    /// Architecture-tagged patches with their own byte pairs
    #[serde(default, deserialize_with = "nullable")]
    pub stereo_patches: Vec<StereoPatch>,
    /// Code caves for injected functions
    #[serde(default, deserialize_with = "nullable")]
    pub injection_sites: Vec<DiscoveredInjectionSite>,
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Module build whose offsets are baked in.
pub const BUILTIN_MODULE_VERSION: &str = "0.0.376";

/// Slice-relative x86_64 offsets for the baked-in module build.
const BUILTIN_OFFSETS: &[(KnownPatch, u64)] = &[
    (KnownPatch::EmulateStereoSuccess1, 0xA296FF),
    (KnownPatch::EmulateStereoSuccess2, 0xA29700),
    (KnownPatch::CreateAudioFrameStereo, 0xA1E34A),
    (KnownPatch::AudioEncoderOpusConfigSetChannels, 0x41BE45),
    (KnownPatch::MonoDownmixer, 0x9E9DEB),
    (KnownPatch::EmulateBitrateModified, 0xA29B5E),
    (KnownPatch::SetsBitrateBitrateValue, 0x6091E0),
    (KnownPatch::SetsBitrateBitwiseOr, 0x6091E8),
    (KnownPatch::DuplicateEmulateBitrateModified, 0xA2EA44),
    (KnownPatch::HighPassFilter, 0x2B6EC0),
    (KnownPatch::DownmixFunc, 0x3FAE70),
    (KnownPatch::AudioEncoderOpusConfigIsOk, 0x41C150),
    (KnownPatch::ThrowError, 0x945240),
    (KnownPatch::EncoderConfigInit1, 0x41BE4F),
    (KnownPatch::EncoderConfigInit2, 0x41B9C8),
    (KnownPatch::SdpStereoForce1, 0xA26B56),
    (KnownPatch::SdpStereoForce2, 0xA297AD),
];

/// Slice-relative injection caves for the baked-in module build.
const BUILTIN_INJECTION_SITES: &[(InjectionSiteKind, u64)] = &[
    (InjectionSiteKind::HighpassCutoffFilter, 0x403A90),
    (InjectionSiteKind::DcReject, 0x403C20),
];

impl DiscoveryDocument {
    /// Parses a document from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::discovery(format!("unparsable discovery output: {}", e)))
    }

    /// Loads a document from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::discovery(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Serializes the document as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::discovery(e.to_string()))
    }

    /// Returns true if the document names nothing at all.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
            && self.file_offsets.is_empty()
            && self.stereo_patches.is_empty()
            && self.injection_sites.is_empty()
    }

    /// Builds the fixed-offset document for the baked-in module build.
    ///
    /// Offsets are relative to the x86_64 slice, which starts at `x86_base`
    /// in the current file (0 for a thin binary).
    pub fn builtin(x86_base: u64) -> Self {
        let patches = BUILTIN_OFFSETS
            .iter()
            .map(|&(patch, rel)| DiscoveredPatch {
                name: Some(patch.name().to_string()),
                file_offset: Some(OffsetValue::Int(x86_base + rel)),
                // The channel-count byte is the one site with a known original.
                expected_original: (patch == KnownPatch::EmulateStereoSuccess1)
                    .then(|| "01".to_string()),
                va: Some(OffsetValue::Int(rel)),
            })
            .collect();

        let injection_sites = BUILTIN_INJECTION_SITES
            .iter()
            .map(|&(kind, rel)| DiscoveredInjectionSite {
                name: Some(kind.name().to_string()),
                file_offset: Some(OffsetValue::Int(x86_base + rel)),
                arch: None,
            })
            .collect();

        Self {
            patches,
            injection_sites,
            ..Default::default()
        }
    }

    /// Flattens named offsets (`file_offsets` first, then `patches`).
    ///
    /// Entries whose offset cannot be parsed are skipped.
    pub fn offset_table(&self) -> BTreeMap<String, u64> {
        let mut table: BTreeMap<String, u64> = self
            .file_offsets
            .iter()
            .filter_map(|(name, off)| off.value().ok().map(|v| (name.clone(), v)))
            .collect();

        for patch in &self.patches {
            let (Some(name), Some(off)) = (&patch.name, &patch.file_offset) else {
                continue;
            };
            if let Ok(v) = off.value() {
                table.entry(name.clone()).or_insert(v);
            }
        }
        table
    }
}

// =============================================================================
// Version Comparison
// =============================================================================

/// Offset of one name in two documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetDelta {
    /// Patch name
    pub name: String,
    /// Offset in the first document
    pub a: Option<u64>,
    /// Offset in the second document
    pub b: Option<u64>,
}

impl OffsetDelta {
    /// Returns `b - a` when both are present.
    pub fn delta(&self) -> Option<i64> {
        match (self.a, self.b) {
            (Some(a), Some(b)) => Some(b as i64 - a as i64),
            _ => None,
        }
    }
}

/// Compares the named offsets of two documents, sorted by name.
pub fn diff_offsets(a: &DiscoveryDocument, b: &DiscoveryDocument) -> Vec<OffsetDelta> {
    let left = a.offset_table();
    let right = b.offset_table();

    let mut names: Vec<&String> = left.keys().chain(right.keys()).collect();
    names.sort();
    names.dedup();

    names
        .into_iter()
        .map(|name| OffsetDelta {
            name: name.clone(),
            a: left.get(name).copied(),
            b: right.get(name).copied(),
        })
        .collect()
}

// =============================================================================
// External Finder
// =============================================================================

/// Default time the finder may run before the session gives up.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// External offset finder invocation.
///
/// Runs `program [args...] <target> --export <export_path>`.
#[derive(Debug, Clone)]
pub struct DiscoveryCommand {
    /// Program to run
    pub program: PathBuf,
    /// Arguments placed before the target path
    pub args: Vec<String>,
    /// Maximum wait
    pub timeout: Duration,
}

impl DiscoveryCommand {
    /// Creates a command with the default timeout.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Adds arguments placed before the target path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the finder against `target`, exporting to `export_path`.
    pub fn run(&self, target: &Path, export_path: &Path) -> Result<DiscoveryDocument> {
        info!("Running offset finder: {}", self.program.display());

        // A stale export must not be mistaken for fresh output.
        let _ = fs::remove_file(export_path);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(target)
            .arg("--export")
            .arg(export_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::discovery(format!("cannot start {}: {}", self.program.display(), e))
            })?;

        // Drain stderr so a chatty finder cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let start = Instant::now();
        let status = loop {
            let polled = child
                .try_wait()
                .map_err(|e| Error::discovery(format!("cannot poll offset finder: {}", e)))?;
            if let Some(status) = polled {
                break status;
            }
            if start.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::discovery(format!(
                    "offset finder timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
            thread::sleep(Duration::from_millis(50));
        };

        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        // Exit status 1 means some sites were not found; the export is still valid.
        if status.code().map_or(true, |code| code > 1) {
            return Err(Error::discovery(format!(
                "offset finder failed ({}): {}",
                status,
                stderr.trim()
            )));
        }

        debug!("offset finder finished in {:.2}s", start.elapsed().as_secs_f64());
        DiscoveryDocument::load(export_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": "0.0.377",
        "patches": [
            {"name": "EmulateStereoSuccess1", "file_offset": "0xA296FF", "expected_original": "01", "pattern": "ignored"},
            {"name": "HighPassFilter", "file_offset": 2846400}
        ],
        "file_offsets": {"ThrowError": "945240"},
        "stereo_patches": [
            {"arch": "arm64", "fat_offset": 1081344, "va": 4096, "orig": "20 00 80 52", "patch": "40 00 80 52", "name": "channels"}
        ],
        "injection_sites": [
            {"name": "HighpassCutoffFilter", "file_offset": "0x403A90"},
            {"name": "DcReject", "file_offset": 4209696}
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let doc = DiscoveryDocument::from_json(SAMPLE).unwrap();

        assert_eq!(doc.patches.len(), 2);
        assert_eq!(doc.patches[0].file_offset.as_ref().unwrap().value().unwrap(), 0xA296FF);
        assert_eq!(doc.patches[1].file_offset.as_ref().unwrap().value().unwrap(), 0x2B6EC0);
        assert_eq!(doc.file_offsets["ThrowError"].value().unwrap(), 0x945240);
        assert_eq!(doc.stereo_patches[0].arch.as_deref(), Some("arm64"));
        assert_eq!(doc.injection_sites[1].file_offset.as_ref().unwrap().value().unwrap(), 0x403C20);
    }

    #[test]
    fn test_null_and_missing_fields() {
        let doc = DiscoveryDocument::from_json(r#"{"patches": null, "stereo_patches": []}"#).unwrap();
        assert!(doc.is_empty());
        assert!(DiscoveryDocument::from_json("{}").unwrap().is_empty());
    }

    #[test]
    fn test_unparsable_is_discovery_failure() {
        assert!(matches!(
            DiscoveryDocument::from_json("not json"),
            Err(Error::DiscoveryUnavailable { .. })
        ));
        assert!(matches!(
            DiscoveryDocument::load("/nonexistent/export.json"),
            Err(Error::DiscoveryUnavailable { .. })
        ));
    }

    #[test]
    fn test_builtin_document() {
        let doc = DiscoveryDocument::builtin(0x1000);

        assert_eq!(doc.patches.len(), KnownPatch::ALL.len());
        assert_eq!(doc.offset_table()["EmulateStereoSuccess1"], 0x1000 + 0xA296FF);
        assert_eq!(doc.injection_sites.len(), 2);
        assert_eq!(
            doc.injection_sites[0].file_offset.as_ref().unwrap().value().unwrap(),
            0x1000 + 0x403A90
        );
    }

    #[test]
    fn test_json_round_trip_keeps_offsets() {
        let doc = DiscoveryDocument::builtin(0);
        let reparsed = DiscoveryDocument::from_json(&doc.to_json().unwrap()).unwrap();
        assert_eq!(doc, reparsed);
    }

    #[test]
    fn test_diff_offsets() {
        let a = DiscoveryDocument::from_json(r#"{"file_offsets": {"A": 16, "B": 32}}"#).unwrap();
        let b = DiscoveryDocument::from_json(r#"{"file_offsets": {"B": 48, "C": "0x40"}}"#).unwrap();
        let diff = diff_offsets(&a, &b);

        assert_eq!(diff.len(), 3);
        assert_eq!(diff[0].name, "A");
        assert_eq!(diff[0].delta(), None);
        assert_eq!(diff[1].delta(), Some(16));
        assert_eq!(diff[2].b, Some(0x40));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = DiscoveryCommand::new("/nonexistent/finder");
        let err = cmd
            .run(Path::new("/tmp/target"), &dir.path().join("out.json"))
            .unwrap_err();
        assert!(matches!(err, Error::DiscoveryUnavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_finder_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = DiscoveryCommand::new("sh")
            .with_args(["-c", "sleep 5", "finder"])
            .with_timeout(Duration::from_millis(200));
        let err = cmd
            .run(Path::new("/tmp/target"), &dir.path().join("out.json"))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[test]
    fn test_finder_export() {
        let dir = tempfile::tempdir().unwrap();
        let export = dir.path().join("out.json");
        // $0 = "finder", $1 = target, $2 = --export, $3 = export path
        let cmd = DiscoveryCommand::new("sh").with_args([
            "-c",
            r#"printf '{"file_offsets": {"ThrowError": 16}}' > "$3""#,
            "finder",
        ]);
        let doc = cmd.run(Path::new("/tmp/target"), &export).unwrap();
        assert_eq!(doc.offset_table()["ThrowError"], 16);
    }
}

//! Persisted record of the last applied patch session.
//!
//! The record is a single JSON slot keyed by target path. It lets later
//! invocations rebuild the exact sites that were written without re-running
//! discovery. Anything other than a clean load for the same path falls back to
//! discovery; a broken record never aborts a session.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::macho::{Arch, SliceTable};
use crate::patch::PatchSite;
use crate::util::to_hex;

/// x86_64 site record, keyed by patch name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X86Entry {
    /// Absolute file offset at apply time
    pub file_offset: u64,
    /// Replacement bytes as hex
    pub patch_hex: String,
    /// Offset relative to the x86_64 slice base
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub va: Option<u64>,
    /// Original bytes as hex, when they were known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig: Option<String>,
}

/// arm64 site record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arm64Entry {
    /// Site name (without the `ARM64:` prefix)
    pub name: String,
    /// Offset relative to the arm64 slice base
    pub va: u64,
    /// Original bytes as hex
    pub orig: String,
    /// Replacement bytes as hex
    pub patch: String,
}

/// What a successful session applied to one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSessionMetadata {
    /// Target the record belongs to
    pub node_path: String,
    /// x86_64 sites
    #[serde(default)]
    pub x86_64: BTreeMap<String, X86Entry>,
    /// arm64 sites
    #[serde(default)]
    pub arm64: Vec<Arm64Entry>,
}

impl PatchSessionMetadata {
    /// Builds the record from the sites that hold their replacement.
    ///
    /// Slice-relative offsets are taken against `slices`, the layout the sites
    /// were applied to. Sites written by the session carry the bytes they
    /// replaced as their original. arm64 sites without an original are not
    /// recorded.
    pub fn from_applied<'a, I>(target: &Path, sites: I, slices: &SliceTable) -> Self
    where
        I: IntoIterator<Item = &'a PatchSite>,
    {
        let mut meta = Self {
            node_path: target.display().to_string(),
            ..Default::default()
        };

        for site in sites {
            let va = slices
                .base_of(site.arch)
                .and_then(|base| site.offset.checked_sub(base));

            match site.arch {
                Arch::X86_64 => {
                    meta.x86_64.entry(site.name.clone()).or_insert(X86Entry {
                        file_offset: site.offset,
                        patch_hex: to_hex(&site.replacement),
                        va,
                        orig: site.expected.as_deref().map(to_hex),
                    });
                }
                Arch::Arm64 => {
                    let (Some(va), Some(orig)) = (va, site.expected.as_deref()) else {
                        debug!("not recording {}: no slice offset or original", site);
                        continue;
                    };
                    meta.arm64.push(Arm64Entry {
                        name: site.name.clone(),
                        va,
                        orig: to_hex(orig),
                        patch: to_hex(&site.replacement),
                    });
                }
                Arch::Other(_) => {}
            }
        }

        meta
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.x86_64.is_empty() && self.arm64.is_empty()
    }
}

/// Outcome of reading the metadata slot for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataLoadResult {
    /// A record for this target
    Loaded(PatchSessionMetadata),
    /// No record on disk
    Missing,
    /// The record belongs to another target
    PathMismatch {
        /// Path stored in the record
        recorded: String,
    },
    /// The record could not be read or parsed
    Corrupt {
        /// What went wrong
        reason: String,
    },
}

impl MetadataLoadResult {
    /// Returns the record if it was loaded.
    pub fn loaded(self) -> Option<PatchSessionMetadata> {
        match self {
            MetadataLoadResult::Loaded(meta) => Some(meta),
            _ => None,
        }
    }
}

/// Single-slot metadata file.
#[derive(Debug, Clone)]
pub struct PatchStateStore {
    path: PathBuf,
}

impl PatchStateStore {
    /// Creates a store backed by `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Returns the metadata file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the record, replacing any previous one.
    pub fn save(&self, meta: &PatchSessionMetadata) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let json = serde_json::to_string_pretty(meta).map_err(|e| Error::MetadataCorrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        fs::write(&self.path, json).map_err(|e| Error::FileWrite {
            path: self.path.clone(),
            source: e,
        })?;

        debug!("saved patch metadata to {}", self.path.display());
        Ok(())
    }

    /// Reads the record for `target`.
    pub fn load(&self, target: &Path) -> MetadataLoadResult {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return MetadataLoadResult::Missing,
            Err(e) => {
                warn!("cannot read {}: {}", self.path.display(), e);
                return MetadataLoadResult::Corrupt {
                    reason: e.to_string(),
                };
            }
        };

        let meta: PatchSessionMetadata = match serde_json::from_str(&text) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("ignoring corrupt metadata {}: {}", self.path.display(), e);
                return MetadataLoadResult::Corrupt {
                    reason: e.to_string(),
                };
            }
        };

        if meta.node_path != target.display().to_string() {
            debug!("metadata is for {}, not {}", meta.node_path, target.display());
            return MetadataLoadResult::PathMismatch {
                recorded: meta.node_path,
            };
        }

        MetadataLoadResult::Loaded(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::{build_fat_header, parse_slice_table, SliceDescriptor};
    use crate::patch::{KnownPatch, SiteOrigin};

    fn two_slice_table() -> SliceTable {
        let header = build_fat_header(&[
            SliceDescriptor {
                arch: Arch::X86_64,
                cpusubtype: 3,
                file_offset: 0x1000,
                size: 0x1000,
                align: 12,
            },
            SliceDescriptor {
                arch: Arch::Arm64,
                cpusubtype: 0,
                file_offset: 0x4000,
                size: 0x1000,
                align: 14,
            },
        ]);
        parse_slice_table(&header)
    }

    fn sample_sites() -> Vec<PatchSite> {
        vec![
            PatchSite::known(KnownPatch::HighPassFilter, Arch::X86_64, 0x1200, None).unwrap(),
            PatchSite::new(
                "channels",
                Arch::Arm64,
                0x4010,
                Some(vec![0x20, 0x00, 0x80, 0x52]),
                vec![0x40, 0x00, 0x80, 0x52],
                SiteOrigin::Document,
            )
            .unwrap(),
        ]
    }

    #[test]
    fn test_from_applied() {
        let target = Path::new("/tmp/discord_voice.node");
        let meta = PatchSessionMetadata::from_applied(target, &sample_sites(), &two_slice_table());

        let hp = &meta.x86_64["HighPassFilter"];
        assert_eq!(hp.file_offset, 0x1200);
        assert_eq!(hp.va, Some(0x200));
        assert_eq!(hp.patch_hex, "c3");
        assert_eq!(hp.orig, None);

        assert_eq!(meta.arm64.len(), 1);
        assert_eq!(meta.arm64[0].va, 0x10);
        assert_eq!(meta.arm64[0].orig, "20008052");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatchStateStore::new(dir.path().join("cache").join("patch_metadata.json"));
        let target = Path::new("/tmp/discord_voice.node");
        let meta = PatchSessionMetadata::from_applied(target, &sample_sites(), &two_slice_table());

        assert_eq!(store.load(target), MetadataLoadResult::Missing);
        store.save(&meta).unwrap();
        assert_eq!(store.load(target), MetadataLoadResult::Loaded(meta));
    }

    #[test]
    fn test_path_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatchStateStore::new(dir.path().join("patch_metadata.json"));
        let meta = PatchSessionMetadata {
            node_path: "/a/discord_voice.node".into(),
            ..Default::default()
        };
        store.save(&meta).unwrap();

        assert!(matches!(
            store.load(Path::new("/b/discord_voice.node")),
            MetadataLoadResult::PathMismatch { .. }
        ));
    }

    #[test]
    fn test_corrupt_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch_metadata.json");
        fs::write(&path, "{ not json").unwrap();

        let store = PatchStateStore::new(&path);
        let result = store.load(Path::new("/tmp/discord_voice.node"));
        assert!(matches!(result, MetadataLoadResult::Corrupt { .. }));
        assert!(result.loaded().is_none());
    }

    #[test]
    fn test_reads_legacy_x86_entries() {
        // Records without the slice-relative fields still load.
        let json = r#"{
            "node_path": "/tmp/discord_voice.node",
            "x86_64": {"HighPassFilter": {"file_offset": 2846400, "patch_hex": "c3"}}
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch_metadata.json");
        fs::write(&path, json).unwrap();

        let meta = PatchStateStore::new(&path)
            .load(Path::new("/tmp/discord_voice.node"))
            .loaded()
            .unwrap();
        assert_eq!(meta.x86_64["HighPassFilter"].va, None);
        assert!(meta.arm64.is_empty());
    }
}

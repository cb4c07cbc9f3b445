//! Resolution of patch and injection sites for the current file layout.
//!
//! Sites come from two places: the metadata of a previous session (exact
//! slice-relative offsets of what was written) and a discovery document
//! (offsets recorded against the file as it was when discovery ran). Document
//! offsets are corrected per architecture by the slice shift; metadata offsets
//! are rebuilt from the current slice bases.

use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use crate::discovery::{DiscoveredPatch, DiscoveryDocument, StereoPatch};
use crate::error::{Error, Result};
use crate::macho::{Arch, SliceTable};
use crate::patch::{InjectionSite, InjectionSiteKind, KnownPatch, PatchSite, SiteOrigin};
use crate::shift::SliceShift;
use crate::state::PatchSessionMetadata;
use crate::util::{parse_hex, parse_hex_opt, to_hex};

/// Where the sites of one architecture came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteSource {
    /// Rebuilt from a previous session's metadata
    Metadata,
    /// Derived from a discovery document
    Discovery,
    /// No input for this architecture
    None,
}

impl SiteSource {
    /// Returns the source name.
    pub fn name(&self) -> &'static str {
        match self {
            SiteSource::Metadata => "metadata",
            SiteSource::Discovery => "discovery",
            SiteSource::None => "none",
        }
    }
}

impl fmt::Display for SiteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An input entry that did not become a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    /// Entry name as given
    pub name: String,
    /// Architecture the entry was tagged with
    pub arch: Arch,
    /// Why it was rejected
    pub reason: String,
}

/// Everything a session needs to patch the current file.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    /// Byte patch sites, x86_64 first
    pub sites: Vec<PatchSite>,
    /// Injection caves
    pub injection_sites: Vec<InjectionSite>,
    /// Shift applied to document offsets, per architecture
    pub shifts: Vec<SliceShift>,
    /// Source of the x86_64 sites
    pub x86_source: SiteSource,
    /// Source of the arm64 sites
    pub arm64_source: SiteSource,
    /// Entries that were dropped
    pub rejected: Vec<RejectedEntry>,
}

impl ResolvedPlan {
    /// Returns the injection site of the given kind.
    pub fn injection_site(&self, kind: InjectionSiteKind) -> Option<&InjectionSite> {
        self.injection_sites.iter().find(|s| s.kind == kind)
    }

    /// Returns the shift used for an architecture.
    pub fn shift(&self, arch: Arch) -> Option<&SliceShift> {
        self.shifts.iter().find(|s| s.arch == arch)
    }

    /// Returns the sites of one architecture.
    pub fn sites_for(&self, arch: Arch) -> impl Iterator<Item = &PatchSite> {
        self.sites.iter().filter(move |s| s.arch == arch)
    }
}

/// Builds a [`ResolvedPlan`] from a slice table and the available inputs.
#[derive(Debug, Clone, Copy)]
pub struct PlanResolver<'a> {
    slices: &'a SliceTable,
    metadata: Option<&'a PatchSessionMetadata>,
    document: Option<&'a DiscoveryDocument>,
}

impl<'a> PlanResolver<'a> {
    /// Creates a resolver for the given layout.
    pub fn new(slices: &'a SliceTable) -> Self {
        Self {
            slices,
            metadata: None,
            document: None,
        }
    }

    /// Uses a previous session's metadata.
    pub fn with_metadata(mut self, metadata: Option<&'a PatchSessionMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Uses a discovery document.
    pub fn with_document(mut self, document: Option<&'a DiscoveryDocument>) -> Self {
        self.document = document;
        self
    }

    /// Resolves sites and injection caves.
    pub fn resolve(&self) -> ResolvedPlan {
        let mut ctx = Context {
            plan: ResolvedPlan {
                sites: Vec::new(),
                injection_sites: Vec::new(),
                shifts: Vec::new(),
                x86_source: SiteSource::None,
                arm64_source: SiteSource::None,
                rejected: Vec::new(),
            },
            seen: HashSet::new(),
        };

        let (x86_shift, arm64_shift) = match self.document {
            Some(doc) => (
                SliceShift::resolve(
                    Arch::X86_64,
                    x86_records(doc),
                    self.slices.base_of(Arch::X86_64),
                ),
                SliceShift::resolve(
                    Arch::Arm64,
                    stereo_records(doc, Arch::Arm64),
                    self.slices.base_of(Arch::Arm64),
                ),
            ),
            None => (
                SliceShift::assumed(Arch::X86_64, self.slices.base_of(Arch::X86_64)),
                SliceShift::assumed(Arch::Arm64, self.slices.base_of(Arch::Arm64)),
            ),
        };

        // x86_64
        match (self.metadata, self.document) {
            (Some(meta), _) if !meta.x86_64.is_empty() => {
                ctx.plan.x86_source = SiteSource::Metadata;
                self.x86_from_metadata(meta, &mut ctx);
            }
            (_, Some(doc)) => {
                ctx.plan.x86_source = SiteSource::Discovery;
                x86_from_document(doc, &x86_shift, &mut ctx);
            }
            _ => {}
        }

        // arm64
        if let Some(arm64_base) = self.slices.base_of(Arch::Arm64) {
            match (self.metadata, self.document) {
                (Some(meta), _) if !meta.arm64.is_empty() => {
                    ctx.plan.arm64_source = SiteSource::Metadata;
                    arm64_from_metadata(meta, arm64_base, &mut ctx);
                }
                (_, Some(doc)) => {
                    ctx.plan.arm64_source = SiteSource::Discovery;
                    for entry in doc.stereo_patches.iter().filter(|p| is_tagged(p, Arch::Arm64)) {
                        stereo_site(entry, Arch::Arm64, &arm64_shift, &mut ctx);
                    }
                }
                _ => {}
            }
        }

        if let Some(doc) = self.document {
            injection_from_document(doc, &[x86_shift, arm64_shift], &mut ctx);
            ctx.plan.shifts = vec![x86_shift, arm64_shift];
        }

        debug!(
            "resolved {} sites (x86_64: {}, arm64: {}), {} injection sites, {} rejected",
            ctx.plan.sites.len(),
            ctx.plan.x86_source,
            ctx.plan.arm64_source,
            ctx.plan.injection_sites.len(),
            ctx.plan.rejected.len()
        );
        ctx.plan
    }

    fn x86_from_metadata(&self, meta: &PatchSessionMetadata, ctx: &mut Context) {
        let base = self.slices.base_of(Arch::X86_64);

        for (name, entry) in &meta.x86_64 {
            let Some(patch) = KnownPatch::from_name(name) else {
                ctx.reject(name, Arch::X86_64, "unknown patch name");
                continue;
            };
            let offset = match (entry.va, base) {
                (Some(va), Some(base)) => base.saturating_add(va),
                _ => entry.file_offset,
            };
            if entry.patch_hex.replace(' ', "").to_lowercase() != to_hex(patch.replacement()) {
                debug!("{}: recorded bytes differ from canonical, using canonical", name);
            }
            let site = parse_hex_opt(entry.orig.as_deref())
                .and_then(|expected| PatchSite::known(patch, Arch::X86_64, offset, expected));
            ctx.push(name, Arch::X86_64, site);
        }
    }
}

struct Context {
    plan: ResolvedPlan,
    seen: HashSet<(Arch, String)>,
}

impl Context {
    fn reject(&mut self, name: &str, arch: Arch, reason: impl Into<String>) {
        let reason = reason.into();
        debug!("rejected {} ({}): {}", name, arch, reason);
        self.plan.rejected.push(RejectedEntry {
            name: name.to_string(),
            arch,
            reason,
        });
    }

    /// Adds a site unless its name was already taken for the architecture.
    fn push(&mut self, name: &str, arch: Arch, site: Result<PatchSite>) {
        match site {
            Ok(site) => {
                if self.seen.insert((arch, site.name.clone())) {
                    self.plan.sites.push(site);
                } else {
                    debug!("duplicate {} ({}), keeping first", name, arch);
                }
            }
            Err(e) => self.reject(name, arch, e.to_string()),
        }
    }

    fn is_taken(&self, arch: Arch, name: &str) -> bool {
        self.seen.contains(&(arch, name.to_string()))
    }
}

fn is_tagged(entry: &StereoPatch, arch: Arch) -> bool {
    entry.arch.as_deref().and_then(Arch::from_name) == Some(arch)
}

/// Collects `(file offset, slice offset)` pairs for the x86_64 shift.
///
/// A `patches` entry's `va` is read as an offset from the start of the x86_64
/// slice, the same convention `stereo_patches` uses. Entries without one do
/// not contribute.
fn x86_records(doc: &DiscoveryDocument) -> Vec<(u64, u64)> {
    let from_patches = doc.patches.iter().filter_map(|p| {
        let recorded = p.file_offset.as_ref()?.value().ok()?;
        let va = p.va.as_ref()?.value().ok()?;
        Some((recorded, va))
    });
    from_patches.chain(stereo_records(doc, Arch::X86_64)).collect()
}

fn stereo_records(doc: &DiscoveryDocument, arch: Arch) -> Vec<(u64, u64)> {
    doc.stereo_patches
        .iter()
        .filter(|p| is_tagged(p, arch))
        .filter_map(|p| {
            let recorded = p.fat_offset.as_ref()?.value().ok()?;
            let va = p.va.as_ref()?.value().ok()?;
            Some((recorded, va))
        })
        .collect()
}

fn x86_from_document(doc: &DiscoveryDocument, shift: &SliceShift, ctx: &mut Context) {
    for entry in &doc.patches {
        named_patch(doc, entry, shift, ctx);
    }

    for name in doc.file_offsets.keys() {
        if KnownPatch::from_name(name).is_none() {
            ctx.reject(name, Arch::X86_64, "unknown patch name");
        }
    }
    for patch in KnownPatch::ALL {
        let Some(offset) = doc.file_offsets.get(patch.name()) else {
            continue;
        };
        if ctx.is_taken(Arch::X86_64, patch.name()) {
            continue;
        }
        let site = offset
            .value()
            .and_then(|off| shift.apply(off))
            .and_then(|off| PatchSite::known(patch, Arch::X86_64, off, None));
        ctx.push(patch.name(), Arch::X86_64, site);
    }

    for entry in doc.stereo_patches.iter().filter(|p| is_tagged(p, Arch::X86_64)) {
        stereo_site(entry, Arch::X86_64, shift, ctx);
    }
}

fn named_patch(
    doc: &DiscoveryDocument,
    entry: &DiscoveredPatch,
    shift: &SliceShift,
    ctx: &mut Context,
) {
    let Some(name) = entry.name.as_deref() else {
        ctx.reject("<unnamed>", Arch::X86_64, "entry has no name");
        return;
    };
    let Some(patch) = KnownPatch::from_name(name) else {
        ctx.reject(name, Arch::X86_64, "unknown patch name");
        return;
    };
    let Some(offset) = entry
        .file_offset
        .as_ref()
        .or_else(|| doc.file_offsets.get(name))
    else {
        ctx.reject(name, Arch::X86_64, "no file offset");
        return;
    };

    let site = offset
        .value()
        .and_then(|off| shift.apply(off))
        .and_then(|off| {
            let expected = parse_hex_opt(entry.expected_original.as_deref())?;
            PatchSite::known(patch, Arch::X86_64, off, expected)
        });
    ctx.push(name, Arch::X86_64, site);
}

/// Builds a site from an entry that carries its own byte pair.
fn stereo_site(entry: &StereoPatch, arch: Arch, shift: &SliceShift, ctx: &mut Context) {
    let default_name = match arch {
        Arch::Arm64 => "arm64_unknown",
        _ => "x86_unknown",
    };
    let name = entry.name.as_deref().unwrap_or(default_name);
    let known = KnownPatch::from_name(name);

    if arch == Arch::Arm64 && known.is_some() {
        ctx.reject(name, arch, "name is reserved for an x86_64 patch");
        return;
    }
    let Some(fat_offset) = entry.fat_offset.as_ref() else {
        ctx.reject(name, arch, "no file offset");
        return;
    };

    let site = (|| -> Result<PatchSite> {
        let offset = shift.apply(fat_offset.value()?)?;
        let orig = parse_hex(entry.orig.as_deref().unwrap_or_default())?;
        let patch = parse_hex(entry.patch.as_deref().unwrap_or_default())?;
        if orig.is_empty() {
            return Err(Error::EmptyPatch {
                name: name.to_string(),
            });
        }
        match known {
            // Canonical bytes win; the document only contributes the guard.
            Some(known) => PatchSite::known(known, arch, offset, Some(orig)),
            None => PatchSite::new(name, arch, offset, Some(orig), patch, SiteOrigin::Document),
        }
    })();
    ctx.push(name, arch, site);
}

fn arm64_from_metadata(meta: &PatchSessionMetadata, base: u64, ctx: &mut Context) {
    for entry in &meta.arm64 {
        if KnownPatch::from_name(&entry.name).is_some() {
            ctx.reject(&entry.name, Arch::Arm64, "name is reserved for an x86_64 patch");
            continue;
        }
        let site = parse_hex(&entry.orig).and_then(|orig| {
            let patch = parse_hex(&entry.patch)?;
            PatchSite::new(
                entry.name.clone(),
                Arch::Arm64,
                base.saturating_add(entry.va),
                Some(orig),
                patch,
                SiteOrigin::Document,
            )
        });
        ctx.push(&entry.name, Arch::Arm64, site);
    }
}

fn injection_from_document(doc: &DiscoveryDocument, shifts: &[SliceShift], ctx: &mut Context) {
    for entry in &doc.injection_sites {
        let name = entry.name.as_deref().unwrap_or("<unnamed>");
        let Some(kind) = InjectionSiteKind::from_name(name) else {
            debug!("ignoring unknown injection site {}", name);
            continue;
        };
        let Some(arch) = entry.arch.as_deref().map_or(Some(Arch::X86_64), Arch::from_name) else {
            ctx.reject(name, Arch::X86_64, "unknown architecture tag");
            continue;
        };
        if ctx.plan.injection_site(kind).is_some() {
            debug!("duplicate injection site {}, keeping first", name);
            continue;
        }
        let Some(offset) = entry.file_offset.as_ref() else {
            ctx.reject(name, arch, "no file offset");
            continue;
        };

        let shift = shifts.iter().find(|s| s.arch == arch);
        let resolved = offset.value().and_then(|off| match shift {
            Some(shift) => shift.apply(off),
            None => Ok(off),
        });
        match resolved {
            Ok(offset) => ctx.plan.injection_sites.push(InjectionSite { kind, arch, offset }),
            Err(e) => ctx.reject(name, arch, e.to_string()),
        }
    }
}

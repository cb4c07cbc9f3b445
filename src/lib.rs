//! fatpatch - A byte patch and code injection engine for fat Mach-O binaries.
//!
//! This library patches a native module shipped as a fat (universal) Mach-O
//! file containing x86_64 and arm64 slices. Patch sites are located by an
//! external offset finder, or by a baked-in table for a known module build,
//! and are corrected for slices that moved since the offsets were recorded.
//!
//! # Features
//!
//! - Fat header parsing (32-bit and 64-bit slice tables)
//! - Per-architecture slice shift correction
//! - Idempotent, guarded byte patches with read-back verification
//! - All-or-nothing code injection into reserved code caves
//! - Persisted session metadata for fast re-checks
//! - PATCHED / UNPATCHED / PARTIAL / OTHER classification
//!
//! # Example
//!
//! ```no_run
//! use fatpatch::{DiscoverySource, PatchSession, PatcherConfig};
//!
//! fn main() -> fatpatch::Result<()> {
//!     let session = PatchSession::new(
//!         "/path/to/discord_voice.node",
//!         PatcherConfig::default(),
//!         DiscoverySource::File("offsets.json".into()),
//!     );
//!
//!     let report = session.check()?;
//!     println!("{}", report.status.status);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod discovery;
pub mod error;
pub mod image;
pub mod macho;
pub mod patch;
pub mod resolve;
pub mod session;
pub mod shift;
pub mod state;
pub mod status;
pub mod util;

// Re-export main types
pub use discovery::{diff_offsets, DiscoveryCommand, DiscoveryDocument, OffsetDelta};
pub use error::{Error, Result};
pub use image::BinaryImage;
pub use macho::{parse_slice_table, Arch, SliceDescriptor, SliceTable};
pub use patch::{InjectionSiteKind, KnownPatch, PatchSite};
pub use resolve::{PlanResolver, ResolvedPlan, SiteSource};
pub use session::{
    ApplyReport, CheckReport, DiscoverySource, NoopHooks, PatchSession, PatcherConfig,
    ProgressCallback, ProgressInfo, ProgressStage, SessionHooks,
};
pub use shift::{ShiftSource, SliceShift};
pub use state::{MetadataLoadResult, PatchSessionMetadata, PatchStateStore};
pub use status::{FileStatus, SiteStatus, StatusReport};

use std::collections::BTreeMap;

/// Reads both injection payloads from a compiled artifact.
///
/// The artifact must define `hp_cutoff`/`hp_cutoff_end` and
/// `dc_reject`/`dc_reject_end`.
pub fn load_payloads(artifact: &[u8]) -> Result<BTreeMap<InjectionSiteKind, Vec<u8>>> {
    InjectionSiteKind::ALL
        .iter()
        .map(|&kind| Ok((kind, patch::extract_site_blob(artifact, kind)?)))
        .collect()
}

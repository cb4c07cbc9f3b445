//! Check and apply sessions over one target file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryCommand, DiscoveryDocument, DEFAULT_DISCOVERY_TIMEOUT};
use crate::error::{Error, Result};
use crate::image::BinaryImage;
use crate::macho::{Arch, SliceTable};
use crate::patch::{
    apply_sites, place_blobs, validate_blobs, InjectionBlob, InjectionSiteKind, PatchReport,
    MAX_INJECTION_SIZE,
};
use crate::resolve::{PlanResolver, ResolvedPlan};
use crate::state::{MetadataLoadResult, PatchSessionMetadata, PatchStateStore};
use crate::status::{classify, FileStatus, StatusReport};
use crate::util::to_hex;

// =============================================================================
// Configuration
// =============================================================================

/// Session configuration.
#[derive(Debug, Clone)]
pub struct PatcherConfig {
    /// Working directory for exports and metadata
    pub cache_dir: PathBuf,
    /// Metadata slot
    pub metadata_file: PathBuf,
    /// Where backups are written
    pub backup_dir: PathBuf,
    /// Size of each injection cave
    pub max_injection_size: usize,
    /// Injection sites an apply session cannot do without
    pub required_injection_sites: Vec<InjectionSiteKind>,
    /// How long the offset finder may run
    pub discovery_timeout: Duration,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_cache_dir(home.join("Library/Caches/DiscordVoicePatcher"))
    }
}

impl PatcherConfig {
    /// Creates a config with every path rooted in `cache_dir`.
    pub fn with_cache_dir<P: Into<PathBuf>>(cache_dir: P) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            metadata_file: cache_dir.join("patch_metadata.json"),
            backup_dir: cache_dir.join("Backups"),
            cache_dir,
            max_injection_size: MAX_INJECTION_SIZE,
            required_injection_sites: InjectionSiteKind::ALL.to_vec(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Path the offset finder exports to.
    pub fn export_file(&self) -> PathBuf {
        self.cache_dir.join("offsets_export.json")
    }
}

/// Where the discovery document comes from.
#[derive(Debug, Clone)]
pub enum DiscoverySource {
    /// Run an external offset finder
    Command {
        /// Finder program
        program: PathBuf,
        /// Arguments placed before the target path
        args: Vec<String>,
    },
    /// Read a previously exported document
    File(PathBuf),
    /// Use the baked-in offset table
    Builtin,
}

// =============================================================================
// Progress & Hooks
// =============================================================================

/// Progress stage during a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Loading,
    Discovering,
    Resolving,
    Checking,
    Preparing,
    PatchingBytes,
    Injecting,
    Writing,
    Verifying,
    Finalizing,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Loading => "Loading target",
            Self::Discovering => "Discovering offsets",
            Self::Resolving => "Resolving sites",
            Self::Checking => "Checking patch state",
            Self::Preparing => "Preparing target",
            Self::PatchingBytes => "Applying byte patches",
            Self::Injecting => "Injecting code",
            Self::Writing => "Writing file",
            Self::Verifying => "Verifying",
            Self::Finalizing => "Finalizing",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during a session.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    /// Current stage.
    pub stage: ProgressStage,
    /// Item being processed (e.g., site name).
    pub current_item: Option<String>,
    /// Items done in this stage.
    pub current: usize,
    /// Items in this stage.
    pub total: usize,
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Platform steps around the mutation of the target.
pub trait SessionHooks {
    /// Runs after pre-flight and before the first write (backup, signature
    /// removal). The target is reloaded afterwards. Failure aborts the session.
    fn before_mutation(&mut self, _target: &Path) -> Result<()> {
        Ok(())
    }

    /// Runs after the patched file has been written (re-signing, quarantine
    /// clearing). Failure is reported but the file stays patched.
    fn after_flush(&mut self, _target: &Path) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

// =============================================================================
// Reports
// =============================================================================

/// Result of a check session.
#[derive(Debug)]
pub struct CheckReport {
    /// Classification of every site
    pub status: StatusReport,
    /// Sites that were classified
    pub plan: ResolvedPlan,
}

/// Result of an apply session.
#[derive(Debug)]
pub struct ApplyReport {
    /// Classification before anything was written
    pub preflight: StatusReport,
    /// Plan the session executed
    pub plan: ResolvedPlan,
    /// True if the target was already fully patched and left alone
    pub already_patched: bool,
    /// Per-site byte patch results, verified against the written file
    pub patches: PatchReport,
    /// Injected bytes
    pub injected: usize,
    /// Whether every injected blob read back intact
    pub injection_verified: bool,
    /// Whether the metadata slot was updated
    pub metadata_saved: bool,
    /// Failure of the post-write hook
    pub finalize_error: Option<Error>,
}

impl ApplyReport {
    /// Returns true if every site and blob is in place and finalization ran.
    pub fn is_complete(&self) -> bool {
        self.already_patched
            || (self.patches.failed() == 0
                && self.injection_verified
                && self.finalize_error.is_none())
    }
}

// =============================================================================
// Session
// =============================================================================

/// A check or apply run against one target.
pub struct PatchSession {
    target: PathBuf,
    config: PatcherConfig,
    source: DiscoverySource,
    hooks: Box<dyn SessionHooks>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for PatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchSession")
            .field("target", &self.target)
            .field("config", &self.config)
            .field("source", &self.source)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl PatchSession {
    /// Creates a session with no hooks and no progress reporting.
    pub fn new<P: Into<PathBuf>>(target: P, config: PatcherConfig, source: DiscoverySource) -> Self {
        Self {
            target: target.into(),
            config,
            source,
            hooks: Box::new(NoopHooks),
            progress: None,
        }
    }

    /// Installs platform hooks.
    pub fn with_hooks<H: SessionHooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Installs a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Returns the target path.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    /// Classifies the target without modifying it.
    ///
    /// Metadata from a previous session for this target is used on its own
    /// when it covers every architecture in the file. Architectures it lacks
    /// are taken from a discovery document, which is then required.
    pub fn check(&self) -> Result<CheckReport> {
        self.report(ProgressStage::Loading, None, 0, 1);
        let image = BinaryImage::open(&self.target)?;
        let slices = image.slice_table();

        let metadata = self.load_metadata().filter(|m| !m.is_empty());
        let document = match metadata.as_ref() {
            Some(meta) if covers(meta, &slices) => {
                info!("Using saved patch metadata");
                None
            }
            Some(_) => {
                info!("Saved patch metadata is incomplete, running discovery");
                Some(self.discover(&slices)?)
            }
            None => Some(self.discover(&slices)?),
        };

        self.report(ProgressStage::Resolving, None, 0, 1);
        let plan = PlanResolver::new(&slices)
            .with_metadata(metadata.as_ref())
            .with_document(document.as_ref())
            .resolve();

        self.report(ProgressStage::Checking, None, 0, plan.sites.len());
        let status = classify(&image, &plan.sites);
        info!("{}: {}", self.target.display(), status.status);

        self.report(ProgressStage::Complete, None, 1, 1);
        Ok(CheckReport { status, plan })
    }

    /// Patches the target.
    ///
    /// `payloads` holds the compiled function for each injection site. Nothing
    /// is written unless discovery succeeds, both injection sites resolve and
    /// every blob fits its cave. Sites always come from the document just
    /// discovered; saved metadata is only rewritten afterwards.
    pub fn apply(&mut self, payloads: &BTreeMap<InjectionSiteKind, Vec<u8>>) -> Result<ApplyReport> {
        self.report(ProgressStage::Loading, None, 0, 1);
        let image = BinaryImage::open(&self.target)?;
        let slices = image.slice_table();

        let document = self.discover(&slices)?;

        self.report(ProgressStage::Resolving, None, 0, 1);
        let plan = PlanResolver::new(&slices).with_document(Some(&document)).resolve();

        self.report(ProgressStage::Checking, None, 0, plan.sites.len());
        let preflight = classify(&image, &plan.sites);
        if preflight.status == FileStatus::Patched {
            info!("Already patched (all {} sites match), nothing to do", preflight.sites.len());
            self.report(ProgressStage::Complete, None, 1, 1);
            return Ok(ApplyReport {
                preflight,
                plan,
                already_patched: true,
                patches: PatchReport::default(),
                injected: 0,
                injection_verified: true,
                metadata_saved: false,
                finalize_error: None,
            });
        }

        let blobs = self.build_blobs(&plan, payloads)?;
        validate_blobs(&blobs, image.len())?;
        drop(image);

        self.report(ProgressStage::Preparing, None, 0, 1);
        self.hooks.before_mutation(&self.target)?;

        // The hook may have rewritten the container; start over from disk.
        let mut image = BinaryImage::open(&self.target)?;
        let slices = image.slice_table();
        let plan = PlanResolver::new(&slices).with_document(Some(&document)).resolve();
        for shift in plan.shifts.iter().filter(|s| s.is_shifted()) {
            info!("Offsets corrected for {}", shift);
        }
        let blobs = self.build_blobs(&plan, payloads)?;

        let total = plan.sites.len();
        self.report(ProgressStage::PatchingBytes, None, 0, total);
        let mut patches = apply_sites(&mut image, &plan.sites, |i, site| {
            self.report(ProgressStage::PatchingBytes, Some(site.display_name()), i + 1, total)
        });
        info!(
            "Byte patches: {} applied, {} already in place, {} failed",
            patches.applied(),
            patches.already_applied(),
            patches.failed()
        );

        self.report(ProgressStage::Injecting, None, 0, blobs.len());
        let injected = place_blobs(&mut image, &blobs)?;

        self.report(ProgressStage::Writing, None, 0, 1);
        image.flush()?;

        self.report(ProgressStage::Verifying, None, 0, total);
        let written = BinaryImage::open(&self.target)?;
        verify_sites(&written, &mut patches);
        let injection_verified = blobs
            .iter()
            .all(|b| written.read(b.offset, b.bytes.len()) == Some(b.bytes.as_slice()));
        if !injection_verified {
            warn!("Injected code did not read back intact");
        }

        let meta = PatchSessionMetadata::from_applied(
            &self.target,
            patches.successful_sites(),
            &slices,
        );
        let metadata_saved = !meta.is_empty() && self.save_metadata(&meta);

        self.report(ProgressStage::Finalizing, None, 0, 1);
        let finalize_error = self.hooks.after_flush(&self.target).err();
        if let Some(ref e) = finalize_error {
            warn!("Finalization failed: {}", e);
        }

        self.report(ProgressStage::Complete, None, 1, 1);
        Ok(ApplyReport {
            preflight,
            plan,
            already_patched: false,
            patches,
            injected,
            injection_verified,
            metadata_saved,
            finalize_error,
        })
    }

    fn report(&self, stage: ProgressStage, current_item: Option<String>, current: usize, total: usize) {
        if let Some(ref cb) = self.progress {
            cb(&ProgressInfo {
                stage,
                current_item,
                current,
                total,
            });
        }
    }

    fn discover(&self, slices: &SliceTable) -> Result<DiscoveryDocument> {
        self.report(ProgressStage::Discovering, None, 0, 1);

        match &self.source {
            DiscoverySource::Command { program, args } => {
                fs::create_dir_all(&self.config.cache_dir).map_err(|e| {
                    Error::discovery(format!(
                        "cannot create {}: {}",
                        self.config.cache_dir.display(),
                        e
                    ))
                })?;
                DiscoveryCommand::new(program)
                    .with_args(args.iter().cloned())
                    .with_timeout(self.config.discovery_timeout)
                    .run(&self.target, &self.config.export_file())
            }
            DiscoverySource::File(path) => {
                info!("Reading offsets from {}", path.display());
                DiscoveryDocument::load(path)
            }
            DiscoverySource::Builtin => {
                let base = slices.base_of(Arch::X86_64).ok_or_else(|| {
                    Error::discovery("built-in offsets need an x86_64 slice")
                })?;
                info!("Using built-in offsets (x86_64 base {:#x})", base);
                Ok(DiscoveryDocument::builtin(base))
            }
        }
    }

    fn store(&self) -> PatchStateStore {
        PatchStateStore::new(&self.config.metadata_file)
    }

    fn load_metadata(&self) -> Option<PatchSessionMetadata> {
        match self.store().load(&self.target) {
            MetadataLoadResult::Loaded(meta) => Some(meta),
            MetadataLoadResult::Missing => None,
            MetadataLoadResult::PathMismatch { recorded } => {
                debug!("saved metadata belongs to {}", recorded);
                None
            }
            MetadataLoadResult::Corrupt { reason } => {
                warn!("Ignoring saved metadata: {}", reason);
                None
            }
        }
    }

    fn save_metadata(&self, meta: &PatchSessionMetadata) -> bool {
        match self.store().save(meta) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not save patch metadata: {}", e);
                false
            }
        }
    }

    fn build_blobs(
        &self,
        plan: &ResolvedPlan,
        payloads: &BTreeMap<InjectionSiteKind, Vec<u8>>,
    ) -> Result<Vec<InjectionBlob>> {
        for &kind in &self.config.required_injection_sites {
            if plan.injection_site(kind).is_none() {
                return Err(Error::MissingInjectionSite { name: kind.name() });
            }
            if !payloads.contains_key(&kind) {
                return Err(Error::MissingPayload { name: kind.name() });
            }
        }

        let mut blobs = Vec::with_capacity(payloads.len());
        for (&kind, bytes) in payloads {
            let site = plan
                .injection_site(kind)
                .ok_or(Error::MissingInjectionSite { name: kind.name() })?;
            let blob = InjectionBlob::for_site(site, bytes.clone(), self.config.max_injection_size);
            blob.validate_size()?;
            blobs.push(blob);
        }
        Ok(blobs)
    }
}

/// Returns true if `meta` has sites for every architecture in the file.
fn covers(meta: &PatchSessionMetadata, slices: &SliceTable) -> bool {
    let has_x86 = slices.base_of(Arch::X86_64).is_none() || !meta.x86_64.is_empty();
    let has_arm64 = slices.base_of(Arch::Arm64).is_none() || !meta.arm64.is_empty();
    has_x86 && has_arm64
}

/// Marks sites whose bytes did not survive the write as failed.
fn verify_sites(written: &BinaryImage, report: &mut PatchReport) {
    let mismatched: Vec<(usize, Error)> = report
        .results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_success())
        .filter_map(|(i, r)| {
            let site = &r.site;
            let actual = written.read(site.offset, site.len());
            if actual == Some(site.replacement.as_slice()) {
                return None;
            }
            Some((
                i,
                Error::VerificationMismatch {
                    name: site.display_name(),
                    offset: site.offset,
                    expected: to_hex(&site.replacement),
                    actual: actual.map(to_hex).unwrap_or_default(),
                },
            ))
        })
        .collect();

    for (i, err) in mismatched {
        warn!("  [FAIL] {}", err);
        report.mark_failed(i, err);
    }
}

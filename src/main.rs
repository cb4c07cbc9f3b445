//! fatpatch - Patch a fat Mach-O voice module in place.
//!
//! Check, apply, and inspect byte patches and injected code in a universal
//! binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use fatpatch::util::format_size;
use fatpatch::{
    diff_offsets, load_payloads, parse_slice_table, DiscoveryDocument, DiscoverySource, Error,
    FileStatus, PatchSession, PatcherConfig, ProgressInfo, ProgressStage, SessionHooks,
};

/// Backups kept per backup directory.
const MAX_BACKUPS: usize = 10;

/// A patch engine for fat Mach-O binaries.
#[derive(Parser, Debug)]
#[command(name = "fatpatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cache directory for metadata, exports and backups
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Where patch offsets come from.
#[derive(Args, Debug)]
struct SourceArgs {
    /// Discovery document exported by the offset finder
    #[arg(long, conflicts_with_all = ["finder", "builtin"])]
    discovery: Option<PathBuf>,

    /// Offset finder program, run as `<finder> [args] <target> --export <file>`
    #[arg(long, conflicts_with = "builtin")]
    finder: Option<PathBuf>,

    /// Argument passed to the finder before the target (repeatable)
    #[arg(long = "finder-arg", requires = "finder", allow_hyphen_values = true)]
    finder_args: Vec<String>,

    /// Seconds the finder may run
    #[arg(long, requires = "finder")]
    timeout: Option<u64>,

    /// Use the built-in offsets for module 0.0.376
    #[arg(long)]
    builtin: bool,
}

impl SourceArgs {
    fn into_source(self) -> Result<DiscoverySource> {
        if let Some(path) = self.discovery {
            return Ok(DiscoverySource::File(path));
        }
        if let Some(program) = self.finder {
            return Ok(DiscoverySource::Command {
                program,
                args: self.finder_args,
            });
        }
        if self.builtin {
            return Ok(DiscoverySource::Builtin);
        }
        bail!("One of --discovery, --finder or --builtin is required");
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report whether the target is patched
    Check {
        /// Target binary. If not specified, searches the Discord install.
        target: Option<PathBuf>,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Apply byte patches and inject code
    Apply {
        /// Target binary. If not specified, searches the Discord install.
        target: Option<PathBuf>,

        /// Compiled object holding the injected functions
        #[arg(short, long)]
        artifact: PathBuf,

        /// Patch a copy at this path instead of the target
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Skip signature removal and ad-hoc re-signing
        #[arg(long)]
        no_sign: bool,

        /// Skip the backup copy
        #[arg(long)]
        no_backup: bool,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Show the slice table
    Slices {
        /// Target binary
        target: PathBuf,
    },

    /// Compare the named offsets of two discovery documents
    Diff {
        /// Older document
        old: PathBuf,

        /// Newer document
        new: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose.saturating_add(1));

    let mut config = match cli.cache_dir {
        Some(dir) => PatcherConfig::with_cache_dir(dir),
        None => PatcherConfig::default(),
    };

    match cli.command {
        Commands::Check { target, source } => {
            if let Some(secs) = source.timeout {
                config.discovery_timeout = Duration::from_secs(secs);
            }
            cmd_check(get_target(target)?, source.into_source()?, config)
        }
        Commands::Apply {
            target,
            artifact,
            output,
            no_sign,
            no_backup,
            source,
        } => {
            if let Some(secs) = source.timeout {
                config.discovery_timeout = Duration::from_secs(secs);
            }
            cmd_apply(
                get_target(target)?,
                source.into_source()?,
                config,
                &artifact,
                output,
                no_sign,
                no_backup,
            )
        }
        Commands::Slices { target } => cmd_slices(&target),
        Commands::Diff { old, new } => cmd_diff(&old, &new),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Gets the target path, searching the Discord install if not specified.
fn get_target(target: Option<PathBuf>) -> Result<PathBuf> {
    let path = match target {
        Some(path) => path,
        None => find_default_target()?,
    };
    if !path.is_file() {
        bail!("File not found: {}", path.display());
    }
    Ok(path)
}

/// Finds `discord_voice.node` under the Discord application support directory.
fn find_default_target() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    let base = Path::new(&home).join("Library/Application Support/discord");

    let mut pending = vec![base.clone()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.file_name().is_some_and(|n| n == "discord_voice.node") {
                info!("Found target: {}", path.display());
                return Ok(path);
            }
        }
    }

    bail!(
        "No target given and no discord_voice.node found under {}",
        base.display()
    );
}

fn cmd_check(target: PathBuf, source: DiscoverySource, config: PatcherConfig) -> Result<()> {
    let session = PatchSession::new(&target, config, source);
    let report = session
        .check()
        .with_context(|| format!("Failed to check: {}", target.display()))?;

    let status = &report.status;
    println!("{}", status.status);
    if status.status != FileStatus::Patched && !status.sites.is_empty() {
        for site in &status.sites {
            println!("  {}: {}", site.name, site.status);
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_apply(
    target: PathBuf,
    source: DiscoverySource,
    config: PatcherConfig,
    artifact: &Path,
    output: Option<PathBuf>,
    no_sign: bool,
    no_backup: bool,
) -> Result<()> {
    let start = Instant::now();

    let artifact_data = fs::read(artifact)
        .with_context(|| format!("Failed to read artifact: {}", artifact.display()))?;
    let payloads = load_payloads(&artifact_data)
        .with_context(|| format!("Failed to extract payloads from {}", artifact.display()))?;
    for (kind, bytes) in &payloads {
        info!("Payload {}: {} bytes", kind.name(), bytes.len());
    }

    let target = match output {
        Some(copy) => {
            fs::copy(&target, &copy).with_context(|| {
                format!("Failed to copy {} to {}", target.display(), copy.display())
            })?;
            info!("Patching copy: {}", copy.display());
            copy
        }
        None => target,
    };

    let hooks = CliHooks {
        backup_dir: (!no_backup).then(|| config.backup_dir.clone()),
        sign: !no_sign,
    };

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let pb = progress.clone();
    let mut session = PatchSession::new(&target, config, source)
        .with_hooks(hooks)
        .with_progress(Box::new(move |info: &ProgressInfo| {
            pb.set_length(info.total as u64);
            pb.set_position(info.current as u64);
            match (info.stage, info.current_item.as_deref()) {
                (ProgressStage::PatchingBytes, Some(item)) => {
                    pb.set_message(format!("{} - {}", info.stage.name(), item))
                }
                _ => pb.set_message(info.stage.name()),
            }
        }));

    let result = session.apply(&payloads);
    progress.finish_and_clear();
    let report = result.with_context(|| format!("Failed to patch: {}", target.display()))?;

    if report.already_patched {
        println!("Already patched (all patch sites match). No changes made.");
        return Ok(());
    }

    for shift in report.plan.shifts.iter().filter(|s| s.is_shifted()) {
        println!("Slice shift: {}", shift);
    }
    println!(
        "Byte patches: {} applied, {} already in place, {} failed",
        report.patches.applied(),
        report.patches.already_applied(),
        report.patches.failed()
    );
    for failed in report.patches.results.iter().filter(|r| !r.is_success()) {
        if let Err(ref e) = failed.result {
            error!("  {}: {}", failed.site.display_name(), e);
        }
    }
    println!("Code injection: {} bytes", report.injected);
    if !report.metadata_saved {
        warn!("Patch metadata was not saved; the next check will re-run discovery");
    }

    if !report.injection_verified {
        bail!("Injected code did not verify in {}", target.display());
    }
    if let Some(ref e) = report.finalize_error {
        bail!("Patched, but finalization failed: {}", e);
    }
    if report.patches.failed() > 0 {
        bail!("{} patch sites failed", report.patches.failed());
    }

    println!(
        "Patched {} in {:.2}s",
        target.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn cmd_slices(target: &Path) -> Result<()> {
    let data =
        fs::read(target).with_context(|| format!("Failed to read: {}", target.display()))?;
    let table = parse_slice_table(&data);

    println!("File:       {}", target.display());
    println!("Size:       {}", format_size(data.len() as u64));
    println!("Container:  {:?}", table.kind);

    if table.slices.is_empty() {
        println!("No slices");
        return Ok(());
    }

    println!("\nSlices:");
    for (i, slice) in table.slices.iter().enumerate() {
        println!(
            "  [{:2}] {:<8} {:#010x} - {:#010x} ({:>8}) align 2^{}",
            i,
            slice.arch.to_string(),
            slice.file_offset,
            slice.end(),
            format_size(slice.size),
            slice.align
        );
    }

    Ok(())
}

fn cmd_diff(old: &Path, new: &Path) -> Result<()> {
    let a = DiscoveryDocument::load(old)
        .with_context(|| format!("Failed to load: {}", old.display()))?;
    let b = DiscoveryDocument::load(new)
        .with_context(|| format!("Failed to load: {}", new.display()))?;

    let fmt = |v: Option<u64>| v.map_or_else(|| "-".to_string(), |v| format!("{:#x}", v));

    println!("{:<36} {:>12} {:>12} {:>10}", "Name", "Old", "New", "Delta");
    for entry in diff_offsets(&a, &b) {
        let delta = entry
            .delta()
            .map_or_else(|| "-".to_string(), |d| format!("{:+#x}", d));
        println!(
            "{:<36} {:>12} {:>12} {:>10}",
            entry.name,
            fmt(entry.a),
            fmt(entry.b),
            delta
        );
    }

    Ok(())
}

// =============================================================================
// Platform Hooks
// =============================================================================

/// Backup and code signing around the mutation.
struct CliHooks {
    /// Backup directory, or `None` to skip backups
    backup_dir: Option<PathBuf>,
    /// Strip and re-apply the code signature
    sign: bool,
}

impl SessionHooks for CliHooks {
    fn before_mutation(&mut self, target: &Path) -> fatpatch::Result<()> {
        if let Some(ref dir) = self.backup_dir {
            let backup = create_backup(target, dir)
                .map_err(|e| Error::hook("backup", e.to_string()))?;
            println!("Backup: {}", backup.display());
        }

        if self.sign {
            // Stripping the signature shrinks slices; the session reloads after this.
            if !run_tool("codesign", &["--remove-signature"], target) {
                warn!("Could not remove signature from {}", target.display());
            }
        }

        make_writable(target).map_err(|e| Error::hook("permissions", e.to_string()))
    }

    fn after_flush(&mut self, target: &Path) -> fatpatch::Result<()> {
        // Code signatures are cached per inode; give the file a fresh one.
        let tmp = target.with_extension("tmp_inode");
        fs::copy(target, &tmp)
            .and_then(|_| fs::rename(&tmp, target))
            .map_err(|e| Error::hook("inode refresh", e.to_string()))?;

        if self.sign {
            run_tool("codesign", &["--remove-signature"], target);
            if !run_tool("codesign", &["--force", "--sign", "-"], target) {
                return Err(Error::hook("re-sign", "codesign --sign failed"));
            }
            if !run_tool("codesign", &["--verify", "--verbose"], target) {
                return Err(Error::hook("re-sign", "signature did not verify"));
            }
        }

        run_tool("xattr", &["-cr"], target);
        Ok(())
    }
}

/// Runs a platform tool on `target`, returning whether it succeeded.
fn run_tool(program: &str, args: &[&str], target: &Path) -> bool {
    match Command::new(program).args(args).arg(target).output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            warn!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            warn!("Cannot run {}: {}", program, e);
            false
        }
    }
}

/// Copies the target into `dir` with a timestamped name and prunes old copies.
fn create_backup(target: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create backup directory: {}", dir.display()))?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Target has no file name")?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let backup = unused_backup_path(dir, &name, stamp);

    fs::copy(target, &backup)
        .with_context(|| format!("Failed to back up to {}", backup.display()))?;

    let prefix = format!("{}.", name);
    let mut existing: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".backup"))
        })
        .collect();
    existing.sort();
    while existing.len() > MAX_BACKUPS {
        let oldest = existing.remove(0);
        if let Err(e) = fs::remove_file(&oldest) {
            warn!("Could not prune {}: {}", oldest.display(), e);
        }
    }

    Ok(backup)
}

/// Picks a backup path that does not exist yet, so no earlier copy is replaced.
fn unused_backup_path(dir: &Path, name: &str, stamp: u128) -> PathBuf {
    let mut candidate = dir.join(format!("{}.{:020}.backup", name, stamp));
    let mut n = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{}.{:020}-{}.backup", name, stamp, n));
        n += 1;
    }
    candidate
}

#[cfg(unix)]
fn make_writable(target: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(target, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn make_writable(target: &Path) -> std::io::Result<()> {
    let mut perms = fs::metadata(target)?.permissions();
    perms.set_readonly(false);
    fs::set_permissions(target, perms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_never_replaces_existing_copy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("discord_voice.node");
        let backups = dir.path().join("Backups");

        fs::write(&target, b"pristine").unwrap();
        let first = create_backup(&target, &backups).unwrap();

        fs::write(&target, b"patched").unwrap();
        let second = create_backup(&target, &backups).unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"pristine");
        assert_eq!(fs::read(&second).unwrap(), b"patched");
    }

    #[test]
    fn test_unused_backup_path_adds_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let taken = unused_backup_path(dir.path(), "a.node", 7);
        fs::write(&taken, b"x").unwrap();

        let next = unused_backup_path(dir.path(), "a.node", 7);
        assert_ne!(taken, next);
        assert!(next.to_string_lossy().ends_with("-1.backup"));
    }
}

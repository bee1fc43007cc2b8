//! One-shot discovery scan and startup hygiene.
//!
//! The scanner walks a root in deterministic sorted order and returns every
//! file that qualifies as a source archive. The same eligibility predicate
//! drives the filesystem watcher, so a path found by a rescan and one found
//! by a watch event cannot disagree.
//!
//! Hygiene runs once per root at startup, before any archive is touched:
//! orphaned repack temps are removed immediately (nothing can be writing
//! them, since the ledger lock is already ours), aged-out backups and
//! quarantined sources are handed to the disposer, expired trash is purged,
//! and empty fingerprint directories left under scratch are pruned.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::debug;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::BusConfig;
use crate::config::DisposalMode;
use crate::config::RootConfig;
use crate::disposer::Disposer;
use crate::disposer::TrashDisposer;
use crate::error::BusError;

/// Every eligible source archive under the root, sorted by path.
pub fn scan_root(cfg: &BusConfig, root: &RootConfig) -> Result<Vec<PathBuf>, BusError> {
    if !root.path.is_dir() {
        return Err(BusError::io(
            &root.path,
            io::Error::new(io::ErrorKind::NotFound, "root is not a directory"),
        ));
    }

    let mut found = Vec::new();
    let walker = WalkDir::new(&root.path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(root, entry.path()));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.path.display(), %err, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() && is_candidate(cfg, root, entry.path()) {
            found.push(entry.into_path());
        }
    }
    debug!(root = %root.path.display(), count = found.len(), "scan complete");
    Ok(found)
}

/// Whether a path qualifies as a source archive for this root. Used by both
/// the scanner and the watcher.
pub fn is_candidate(cfg: &BusConfig, root: &RootConfig, path: &Path) -> bool {
    if !cfg.is_archive_path(path) || cfg.is_temp_path(path) {
        return false;
    }
    if root.is_internal_path(path) {
        return false;
    }
    let Ok(rel) = path.strip_prefix(&root.path) else {
        return false;
    };
    // No hidden component anywhere below the root; this also covers the
    // state directory.
    !rel.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
    })
}

fn is_skipped_dir(root: &RootConfig, path: &Path) -> bool {
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.starts_with('.'))
    {
        return true;
    }
    path == root.output_dir()
}

/// What one hygiene pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Temp files removed from the source and output trees.
    pub swept: usize,
    /// Empty fingerprint directories pruned from scratch.
    pub pruned: usize,
    /// Trash entries past retention permanently deleted.
    pub purged: usize,
}

/// Startup hygiene for one root. Failures on individual entries are logged
/// and skipped; hygiene never blocks a run.
pub fn sweep_root(cfg: &BusConfig, root: &RootConfig, disposer: &dyn Disposer) -> SweepReport {
    let mut report = SweepReport::default();

    if cfg.disposal == DisposalMode::Trash {
        match TrashDisposer::new(root.trash_dir()).purge_older_than(cfg.trash_retention()) {
            Ok(purged) => report.purged = purged,
            Err(err) => warn!(root = %root.path.display(), %err, "trash purge failed"),
        }
    }

    let mut trees = vec![root.path.clone()];
    let output_dir = root.output_dir();
    if !output_dir.starts_with(&root.path) {
        trees.push(output_dir);
    }
    for tree in trees {
        sweep_tree(cfg, root, &tree, disposer, &mut report);
    }

    prune_empty_scratch_dirs(root, &mut report);

    if report != SweepReport::default() {
        debug!(
            root = %root.path.display(),
            swept = report.swept,
            pruned = report.pruned,
            purged = report.purged,
            "hygiene sweep complete"
        );
    }
    report
}

fn sweep_tree(
    cfg: &BusConfig,
    root: &RootConfig,
    tree: &Path,
    disposer: &dyn Disposer,
    report: &mut SweepReport,
) {
    if !tree.is_dir() {
        return;
    }
    let walker = WalkDir::new(tree)
        .follow_links(false)
        .into_iter()
        // Never descend into the state dir; trash and scratch manage
        // their own lifetimes.
        .filter_entry(|entry| entry.depth() == 0 || entry.path() != root.state_dir());
    for entry in walker {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !cfg.is_temp_path(path) {
            continue;
        }
        if !should_sweep(path, cfg, entry.metadata().ok()) {
            continue;
        }
        match disposer.remove(path) {
            Ok(()) => report.swept += 1,
            Err(err) => warn!(path = %path.display(), %err, "failed to sweep temp file"),
        }
    }
}

/// Repack temps go unconditionally: hygiene runs before any repack starts
/// and the ledger lock keeps other processes off this root, so a `.tmp`
/// here can only be an orphan. Backups and quarantined sources stay until
/// they age past the trash retention window.
fn should_sweep(path: &Path, cfg: &BusConfig, meta: Option<std::fs::Metadata>) -> bool {
    let is_repack_temp = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("tmp"));
    if is_repack_temp {
        return true;
    }
    let Some(modified) = meta.and_then(|m| m.modified().ok()) else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age >= cfg.trash_retention(),
        Err(_) => false,
    }
}

fn prune_empty_scratch_dirs(root: &RootConfig, report: &mut SweepReport) {
    let scratch = root.state_dir().join("scratch");
    if !scratch.is_dir() {
        return;
    }
    let walker = WalkDir::new(&scratch)
        .min_depth(1)
        .contents_first(true)
        .into_iter();
    for entry in walker {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_dir() && std::fs::remove_dir(entry.path()).is_ok() {
            report.pruned += 1;
        }
    }
}

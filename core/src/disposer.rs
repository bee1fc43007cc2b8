//! Disposal capability.
//!
//! Scratch trees and stale state are never deleted outright by default:
//! [`TrashDisposer`] moves them into the root's trash directory under a
//! timestamped name so a bad run can be investigated or undone, and a purge
//! pass removes entries once they are older than the configured retention.
//! [`DeleteDisposer`] is the opt-in permanent variant.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use chrono::Utc;
use tracing::debug;
use tracing::warn;

use crate::config::DisposalMode;
use crate::config::RootConfig;
use crate::error::BusError;

pub trait Disposer: Send + Sync {
    /// Remove a file or directory tree. Missing paths are not an error.
    fn remove(&self, path: &Path) -> Result<(), BusError>;
}

/// Build the configured disposer for one root.
pub fn for_root(root: &RootConfig, mode: DisposalMode) -> Box<dyn Disposer> {
    match mode {
        DisposalMode::Trash => Box::new(TrashDisposer::new(root.trash_dir())),
        DisposalMode::Delete => Box::new(DeleteDisposer),
    }
}

pub struct TrashDisposer {
    trash_dir: PathBuf,
}

impl TrashDisposer {
    pub fn new(trash_dir: PathBuf) -> TrashDisposer {
        TrashDisposer { trash_dir }
    }

    /// Permanently delete trash entries whose mtime is older than `age`.
    /// Returns how many entries were purged.
    pub fn purge_older_than(&self, age: Duration) -> Result<usize, BusError> {
        if !self.trash_dir.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now().checked_sub(age);
        let mut purged = 0;
        let dir = std::fs::read_dir(&self.trash_dir).map_err(|e| BusError::io(&self.trash_dir, e))?;
        for item in dir {
            let item = item.map_err(|e| BusError::io(&self.trash_dir, e))?;
            let path = item.path();
            let expired = match (cutoff, item.metadata().and_then(|m| m.modified())) {
                (Some(cutoff), Ok(modified)) => modified <= cutoff,
                // Unreadable metadata or an age longer than the epoch: leave it.
                _ => age == Duration::ZERO,
            };
            if !expired {
                continue;
            }
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => purged += 1,
                Err(err) => warn!(path = %path.display(), %err, "failed to purge trash entry"),
            }
        }
        if purged > 0 {
            debug!(purged, trash = %self.trash_dir.display(), "purged old trash entries");
        }
        Ok(purged)
    }
}

impl Disposer for TrashDisposer {
    fn remove(&self, path: &Path) -> Result<(), BusError> {
        if !path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.trash_dir).map_err(|e| BusError::io(&self.trash_dir, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let mut target = self.trash_dir.join(format!("{stamp}-{name}"));
        let mut bump = 0u32;
        while target.exists() {
            bump += 1;
            target = self.trash_dir.join(format!("{stamp}-{bump}-{name}"));
        }
        std::fs::rename(path, &target).map_err(|e| BusError::io(path, e))?;
        debug!(from = %path.display(), to = %target.display(), "moved to trash");
        Ok(())
    }
}

pub struct DeleteDisposer;

impl Disposer for DeleteDisposer {
    fn remove(&self, path: &Path) -> Result<(), BusError> {
        if !path.exists() {
            return Ok(());
        }
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        result.map_err(|e| BusError::io(path, e))
    }
}

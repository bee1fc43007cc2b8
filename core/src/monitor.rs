//! Filesystem watcher producing settled discovery candidates.
//!
//! Roots are watched recursively; raw notify events are filtered through the
//! same eligibility predicate as the scanner and coalesced per path. A
//! candidate is only surfaced after a quiet window (`debounce_ms`) with no
//! further events for that path, so an archive still being copied in settles
//! before the pipeline ever opens it. Watching starts before the initial
//! rescan, which closes the gap where a file arriving mid-scan would be
//! missed; the worst case is seeing a path twice, and discovery is
//! idempotent.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::TryRecvError;
use std::sync::mpsc::channel;
use std::time::Duration;
use std::time::Instant;

use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tracing::debug;
use tracing::warn;

use crate::config::BusConfig;
use crate::error::BusError;
use crate::scan::is_candidate;
use crate::scan::scan_root;

pub struct Monitor {
    _watcher: RecommendedWatcher,
    rx: Receiver<Result<Event, notify::Error>>,
    cfg: BusConfig,
    debounce: Duration,
    /// Candidate paths awaiting their quiet window, keyed to the last
    /// time an event touched them.
    pending: HashMap<PathBuf, Instant>,
}

impl Monitor {
    /// Start watching every configured root recursively.
    pub fn new(cfg: &BusConfig) -> Result<Monitor, BusError> {
        let (tx, rx) = channel();
        let fallback = cfg
            .roots
            .first()
            .map(|r| r.path.clone())
            .unwrap_or_default();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| notify_error(&fallback, e))?;

        for root in &cfg.roots {
            watcher
                .watch(&root.path, RecursiveMode::Recursive)
                .map_err(|e| notify_error(&root.path, e))?;
            debug!(root = %root.path.display(), "watching root");
        }

        Ok(Monitor {
            _watcher: watcher,
            rx,
            cfg: cfg.clone(),
            debounce: cfg.debounce(),
            pending: HashMap::new(),
        })
    }

    /// One-shot pass over everything already present. Called after the
    /// watcher is running so nothing falls between scan and watch.
    pub fn initial_scan(&self) -> Result<Vec<PathBuf>, BusError> {
        let mut found = Vec::new();
        for root in &self.cfg.roots {
            found.extend(scan_root(&self.cfg, root)?);
        }
        Ok(found)
    }

    /// Drain watcher events and return the candidates whose own quiet
    /// window has elapsed, sorted. The window is per path: a file still
    /// receiving writes stays pending without holding back one that has
    /// gone quiet. `None` means nothing has settled yet; call again after
    /// a short sleep.
    pub fn poll_settled(&mut self) -> Option<Vec<PathBuf>> {
        let now = Instant::now();
        loop {
            match self.rx.try_recv() {
                Ok(Ok(event)) => {
                    if !is_discovery_event(&event) {
                        continue;
                    }
                    for path in &event.paths {
                        let Some(root) = self
                            .cfg
                            .roots
                            .iter()
                            .find(|root| path.starts_with(&root.path))
                        else {
                            continue;
                        };
                        if is_candidate(&self.cfg, root, path) {
                            self.pending.insert(path.clone(), now);
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(%err, "filesystem watcher error");
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        let mut settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= self.debounce)
            .map(|(path, _)| path.clone())
            .collect();
        if settled.is_empty() {
            return None;
        }
        for path in &settled {
            self.pending.remove(path);
        }
        // A path may have been renamed or deleted while it settled.
        settled.retain(|path| path.is_file());
        if settled.is_empty() {
            return None;
        }
        settled.sort();
        debug!(count = settled.len(), "candidates settled");
        Some(settled)
    }
}

/// Creations, content writes, and renames can all introduce an archive;
/// removals and reads cannot.
fn is_discovery_event(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn notify_error(path: &Path, err: notify::Error) -> BusError {
    BusError::io(path, io::Error::other(err))
}

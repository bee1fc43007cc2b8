//! Startup reconciliation of ledger state against the filesystem.
//!
//! Runs once per root before any new discovery: every fingerprint the
//! ledger knows about is classified, and archives that died mid-run are
//! either lined up for resumption or failed outright when the world no
//! longer matches what the ledger promised. Resumption trusts recorded
//! progress only as far as it can be verified: a Succeeded image whose
//! output file is gone makes the whole archive inconsistent, because
//! silently re-processing it could mask a deeper storage problem.
//!
//! Early stages are forgiving. An archive that only reached Discovered or
//! Extracting is resumed by re-extracting from the source, so its scratch
//! state is irrelevant; only Dispatched and Repacking depend on scratch
//! contents surviving the crash.

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::config::BusConfig;
use crate::config::RootConfig;
use crate::disposer::Disposer;
use crate::error::BusError;
use crate::fingerprint::Fingerprint;
use crate::ledger::ArchiveState;
use crate::ledger::ArchiveStatus;
use crate::ledger::Ledger;

/// An image entry a resumed archive still owes the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingImage {
    pub entry: String,
    /// Retries already spent; the next attempt continues from here.
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "kebab-case")]
pub enum Disposition {
    /// Recorded Done; discovery-time dedupe will skip the source too.
    AlreadyDone,
    /// Failed in an earlier run; untouched until the source changes.
    AlreadyFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Crash-interrupted but verifiable; the run re-enters the recorded
    /// stage and submits only the listed entries.
    Resumed {
        resume_from: ArchiveStatus,
        pending: Vec<PendingImage>,
        /// Entries already processed, needed to finish the archive's
        /// accounting; not part of the report surface.
        #[serde(skip)]
        succeeded: Vec<String>,
        /// Entries failed past their retry budget.
        #[serde(skip)]
        permanently_failed: Vec<String>,
    },
    /// The ledger and the filesystem disagree; recorded Failed, scratch
    /// disposed, and the source must be re-extracted on next discovery.
    Inconsistent { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveredArchive {
    pub fingerprint: Fingerprint,
    pub source: PathBuf,
    #[serde(flatten)]
    pub disposition: Disposition,
}

impl RecoveredArchive {
    pub fn newly_failed(&self) -> bool {
        matches!(self.disposition, Disposition::Inconsistent { .. })
    }

    pub fn resumable(&self) -> Option<(&ArchiveStatus, &[PendingImage])> {
        match &self.disposition {
            Disposition::Resumed {
                resume_from,
                pending,
                ..
            } => Some((resume_from, pending)),
            _ => None,
        }
    }
}

/// Classify everything the ledger recorded for one root. Ordering is by
/// source path so reports are stable across runs.
pub fn reconcile(
    cfg: &BusConfig,
    root: &RootConfig,
    ledger: &Ledger,
    disposer: &dyn Disposer,
) -> Result<Vec<RecoveredArchive>, BusError> {
    let mut states: Vec<ArchiveState> = ledger.load_all()?.into_values().collect();
    states.sort_by(|a, b| {
        a.source
            .cmp(&b.source)
            .then_with(|| a.fingerprint.as_str().cmp(b.fingerprint.as_str()))
    });

    let mut recovered = Vec::with_capacity(states.len());
    for state in states {
        let disposition = classify(cfg, root, ledger, disposer, &state)?;
        match &disposition {
            Disposition::Resumed {
                resume_from,
                pending,
                ..
            } => info!(
                source = %state.source.display(),
                stage = ?resume_from,
                pending = pending.len(),
                "resuming interrupted archive"
            ),
            Disposition::Inconsistent { detail } => warn!(
                source = %state.source.display(),
                detail,
                "archive state inconsistent, marked failed"
            ),
            Disposition::AlreadyDone | Disposition::AlreadyFailed { .. } => {}
        }
        recovered.push(RecoveredArchive {
            fingerprint: state.fingerprint.clone(),
            source: state.source.clone(),
            disposition,
        });
    }
    Ok(recovered)
}

fn classify(
    cfg: &BusConfig,
    root: &RootConfig,
    ledger: &Ledger,
    disposer: &dyn Disposer,
    state: &ArchiveState,
) -> Result<Disposition, BusError> {
    match state.status {
        ArchiveStatus::Done => Ok(Disposition::AlreadyDone),
        ArchiveStatus::Failed => Ok(Disposition::AlreadyFailed {
            error: state.error.clone(),
        }),
        _ => match verify_resumable(cfg, root, state) {
            Ok(()) => Ok(Disposition::Resumed {
                resume_from: state.status,
                pending: state
                    .pending_entries(cfg.retry_max)
                    .into_iter()
                    .map(|(entry, retries)| PendingImage { entry, retries })
                    .collect(),
                succeeded: state.succeeded_entries(),
                permanently_failed: state.permanently_failed_entries(cfg.retry_max),
            }),
            Err(detail) => {
                // Record the failure durably before touching scratch, so a
                // crash between the two leaves a terminal state either way.
                ledger.record_archive(
                    &state.fingerprint,
                    ArchiveStatus::Failed,
                    &state.source,
                    Some(&format!("recovery inconsistent: {detail}")),
                )?;
                let scratch = root.scratch_dir(state.fingerprint.as_str());
                if let Err(err) = disposer.remove(&scratch) {
                    warn!(path = %scratch.display(), %err, "failed to dispose scratch");
                }
                Ok(Disposition::Inconsistent { detail })
            }
        },
    }
}

fn verify_resumable(cfg: &BusConfig, root: &RootConfig, state: &ArchiveState) -> Result<(), String> {
    if !state.source.is_file() {
        return Err("source file is gone".to_string());
    }
    let current = Fingerprint::of_file(&state.source)
        .map_err(|err| format!("source unreadable: {err}"))?;
    if current != state.fingerprint {
        return Err("source changed since it was recorded".to_string());
    }

    match state.status {
        // Re-extraction rebuilds scratch from the verified source.
        ArchiveStatus::Discovered | ArchiveStatus::Extracting => Ok(()),
        ArchiveStatus::Dispatched | ArchiveStatus::Repacking => {
            let scratch = root.scratch_dir(state.fingerprint.as_str());
            if !scratch.is_dir() {
                return Err("scratch directory is gone".to_string());
            }
            for entry in state.succeeded_entries() {
                if !scratch.join("out").join(&entry).is_file() {
                    return Err(format!("processed output missing for {entry}"));
                }
            }
            if state.status == ArchiveStatus::Dispatched {
                for (entry, _) in state.pending_entries(cfg.retry_max) {
                    if !scratch.join("in").join(&entry).is_file() {
                        return Err(format!("extracted input missing for {entry}"));
                    }
                }
            }
            Ok(())
        }
        ArchiveStatus::Done | ArchiveStatus::Failed => Ok(()),
    }
}

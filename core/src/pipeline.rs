//! Pipeline coordinator: one archive's trip from discovery to Done.
//!
//! ```text
//! Discovered → Extracting → Dispatched → (all tasks terminal) → Repacking → Done
//!        any stage → Failed on an unrecoverable error
//! ```
//!
//! Every transition is recorded in the ledger before the next stage starts,
//! so a crash always leaves the last completed stage unambiguous. The
//! coordinator holds the per-fingerprint registry lock for the archive's
//! whole lifetime; it is the only thing that mutates the archive or its
//! tasks. Archive-level concurrency is bounded by a semaphore so scratch
//! space stays proportional to `max_active_archives`, not to the backlog.
//!
//! Filesystem-heavy stage work (verify, extract, repack) runs on the
//! blocking pool and retries transient I/O errors a fixed couple of times;
//! corruption is never retried. Scratch is disposed only after a terminal
//! state is durable, which is what makes resumption safe: if the terminal
//! record and the disposal race a crash, the worst case is a leftover
//! scratch directory, never lost progress.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::archive;
use crate::archive::ArchiveEntry;
use crate::config::BusConfig;
use crate::config::FailurePolicy;
use crate::config::RootConfig;
use crate::dispatch::Dispatcher;
use crate::dispatch::ImageTask;
use crate::disposer::Disposer;
use crate::error::BusError;
use crate::error::STAGE_RETRY_MAX;
use crate::fingerprint::Fingerprint;
use crate::ledger::ArchiveStatus;
use crate::ledger::ImageStatus;
use crate::ledger::Ledger;
use crate::recovery::Disposition;
use crate::recovery::PendingImage;
use crate::recovery::RecoveredArchive;
use crate::registry::ActiveArchives;
use crate::report::ArchiveOutcome;
use crate::report::ArchiveReport;

const STAGE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Everything archive processing needs that is tied to one root.
pub struct RootContext {
    pub root: RootConfig,
    pub ledger: Arc<Ledger>,
    pub disposer: Arc<dyn Disposer>,
}

#[derive(Clone)]
pub struct Coordinator {
    cfg: Arc<BusConfig>,
    dispatcher: Arc<Dispatcher>,
    registry: ActiveArchives,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    /// Fingerprints known terminal, seeded from recovery and extended as
    /// archives finish; discovery-time dedupe without re-reading the ledger.
    finished: Arc<Mutex<HashSet<Fingerprint>>>,
}

impl Coordinator {
    pub fn new(
        cfg: Arc<BusConfig>,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
    ) -> Coordinator {
        let slots = Arc::new(Semaphore::new(cfg.max_active_archives));
        Coordinator {
            cfg,
            dispatcher,
            registry: ActiveArchives::new(),
            slots,
            cancel,
            finished: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn mark_finished(&self, fingerprint: Fingerprint) {
        lock_or_recover(&self.finished).insert(fingerprint);
    }

    pub fn already_finished(&self, fingerprint: &Fingerprint) -> bool {
        lock_or_recover(&self.finished).contains(fingerprint)
    }

    /// Drive a freshly discovered source through the full pipeline.
    ///
    /// `Ok(None)` means there was nothing to do right now: the source
    /// vanished before fingerprinting, or another coordinator already holds
    /// this fingerprint. `Err` is reserved for ledger failures, which are
    /// fatal for the process.
    pub async fn process_archive(
        &self,
        ctx: &RootContext,
        source: &Path,
    ) -> Result<Option<ArchiveReport>, BusError> {
        let fingerprint = {
            let path = source.to_path_buf();
            match run_blocking(source, move || Fingerprint::of_file(&path)).await {
                Ok(fingerprint) => fingerprint,
                Err(err) => {
                    debug!(source = %source.display(), %err, "source not readable, skipping");
                    return Ok(None);
                }
            }
        };

        if self.already_finished(&fingerprint) {
            debug!(source = %source.display(), "fingerprint already terminal, skipping");
            return Ok(Some(ArchiveReport::skipped(
                fingerprint,
                source.to_path_buf(),
            )));
        }
        let Some(_guard) = self.registry.try_acquire(&fingerprint) else {
            debug!(source = %source.display(), "fingerprint already in flight, ignoring duplicate");
            return Ok(None);
        };
        let Some(_slot) = self.acquire_slot().await else {
            return Ok(None);
        };

        ctx.ledger
            .record_archive(&fingerprint, ArchiveStatus::Discovered, source, None)?;
        info!(source = %source.display(), %fingerprint, "archive discovered");

        let report = self.run_from_extract(ctx, &fingerprint, source).await?;
        self.note_outcome(&report);
        Ok(Some(report))
    }

    /// Re-enter the pipeline for an archive recovery classified as
    /// resumable. Returns `Ok(None)` for non-resumable dispositions.
    pub async fn resume_archive(
        &self,
        ctx: &RootContext,
        recovered: &RecoveredArchive,
    ) -> Result<Option<ArchiveReport>, BusError> {
        let Disposition::Resumed {
            resume_from,
            pending,
            succeeded,
            permanently_failed,
        } = &recovered.disposition
        else {
            return Ok(None);
        };
        let fingerprint = recovered.fingerprint.clone();
        let source = recovered.source.clone();

        let Some(_guard) = self.registry.try_acquire(&fingerprint) else {
            return Ok(None);
        };
        let Some(_slot) = self.acquire_slot().await else {
            return Ok(None);
        };
        info!(source = %source.display(), stage = ?resume_from, "resuming archive");

        let report = match resume_from {
            // Nothing extracted worth trusting yet; start the stage over.
            ArchiveStatus::Discovered | ArchiveStatus::Extracting => {
                self.run_from_extract(ctx, &fingerprint, &source).await?
            }
            ArchiveStatus::Dispatched => {
                self.run_from_dispatch(
                    ctx,
                    &fingerprint,
                    &source,
                    pending.clone(),
                    succeeded.len(),
                    permanently_failed.clone(),
                )
                .await?
            }
            ArchiveStatus::Repacking => {
                self.run_from_repack(
                    ctx,
                    &fingerprint,
                    &source,
                    succeeded.len(),
                    permanently_failed.clone(),
                )
                .await?
            }
            // Recovery never produces a Resumed disposition for these.
            ArchiveStatus::Done | ArchiveStatus::Failed => return Ok(None),
        };
        self.note_outcome(&report);
        Ok(Some(report))
    }

    async fn acquire_slot(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.slots.acquire() => permit.ok(),
        }
    }

    fn note_outcome(&self, report: &ArchiveReport) {
        if matches!(
            report.outcome,
            ArchiveOutcome::Done | ArchiveOutcome::Failed
        ) {
            self.mark_finished(report.fingerprint.clone());
        }
    }

    async fn run_from_extract(
        &self,
        ctx: &RootContext,
        fingerprint: &Fingerprint,
        source: &Path,
    ) -> Result<ArchiveReport, BusError> {
        ctx.ledger
            .record_archive(fingerprint, ArchiveStatus::Extracting, source, None)?;
        let scratch = ctx.root.scratch_dir(fingerprint.as_str());

        let extracted = {
            let cfg = Arc::clone(&self.cfg);
            let src = source.to_path_buf();
            let dir = scratch.clone();
            run_blocking(&scratch, move || extract_stage(&cfg, &src, &dir)).await
        };
        let entries = match extracted {
            Ok(entries) => entries,
            Err(err) => {
                let quarantine = matches!(err, BusError::ArchiveCorrupt { .. });
                return self
                    .fail_archive(ctx, fingerprint, source, err.to_string(), quarantine, 0, 0)
                    .await;
            }
        };

        let mut pending = Vec::new();
        for entry in &entries {
            if self.cfg.is_image_entry(&entry.name) {
                ctx.ledger
                    .record_image(fingerprint, &entry.name, ImageStatus::Pending, 0)?;
                pending.push(PendingImage {
                    entry: entry.name.clone(),
                    retries: 0,
                });
            }
        }
        debug!(
            source = %source.display(),
            images = pending.len(),
            passthrough = entries.len() - pending.len(),
            "archive extracted"
        );

        self.run_from_dispatch(ctx, fingerprint, source, pending, 0, Vec::new())
            .await
    }

    async fn run_from_dispatch(
        &self,
        ctx: &RootContext,
        fingerprint: &Fingerprint,
        source: &Path,
        pending: Vec<PendingImage>,
        prior_succeeded: usize,
        prior_failed: Vec<String>,
    ) -> Result<ArchiveReport, BusError> {
        ctx.ledger
            .record_archive(fingerprint, ArchiveStatus::Dispatched, source, None)?;
        let scratch = ctx.root.scratch_dir(fingerprint.as_str());

        let mut interrupted = false;
        let mut completions = Vec::with_capacity(pending.len());
        for image in pending {
            let task = ImageTask {
                fingerprint: fingerprint.clone(),
                entry: image.entry.clone(),
                input: scratch.join("in").join(&image.entry),
                output: scratch.join("out").join(&image.entry),
                retries_done: image.retries,
            };
            // Submission blocks on a full queue; bail out promptly when the
            // run is being wound down instead.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                completion = self.dispatcher.submit(Arc::clone(&ctx.ledger), task) => {
                    completions.push(completion);
                }
            }
        }

        // The barrier: repacking must not start while any task of this
        // archive is still running.
        let mut succeeded = prior_succeeded;
        let mut failed = prior_failed;
        for result in join_all(completions).await {
            match result {
                Ok(Ok(outcome)) => match outcome.status {
                    ImageStatus::Succeeded => succeeded += 1,
                    _ => failed.push(outcome.entry),
                },
                // The ledger is unwritable; nothing can safely continue.
                Ok(Err(err)) => return Err(err),
                // Dropped before running; the ledger still shows it
                // outstanding, so resume will pick it up.
                Err(_) => interrupted = true,
            }
        }

        if interrupted || self.cancel.is_cancelled() {
            info!(source = %source.display(), "archive interrupted, will resume next run");
            return Ok(interrupted_report(
                fingerprint,
                source,
                succeeded,
                failed.len(),
            ));
        }

        if !failed.is_empty() {
            match self.cfg.failure_policy {
                FailurePolicy::Strict => {
                    let detail = format!("{} image(s) failed permanently", failed.len());
                    return self
                        .fail_archive(
                            ctx,
                            fingerprint,
                            source,
                            detail,
                            false,
                            succeeded,
                            failed.len(),
                        )
                        .await;
                }
                FailurePolicy::BestEffort => {
                    let carried = {
                        let dir = scratch.clone();
                        let failed = failed.clone();
                        run_blocking(&scratch, move || carry_over_originals(&dir, &failed)).await
                    };
                    if let Err(err) = carried {
                        return self
                            .fail_archive(
                                ctx,
                                fingerprint,
                                source,
                                err.to_string(),
                                false,
                                succeeded,
                                failed.len(),
                            )
                            .await;
                    }
                    warn!(
                        source = %source.display(),
                        carried = failed.len(),
                        "carrying unprocessed originals into the output"
                    );
                }
            }
        }

        self.run_from_repack(ctx, fingerprint, source, succeeded, failed)
            .await
    }

    async fn run_from_repack(
        &self,
        ctx: &RootContext,
        fingerprint: &Fingerprint,
        source: &Path,
        images_succeeded: usize,
        failed: Vec<String>,
    ) -> Result<ArchiveReport, BusError> {
        if self.cancel.is_cancelled() {
            return Ok(interrupted_report(
                fingerprint,
                source,
                images_succeeded,
                failed.len(),
            ));
        }
        ctx.ledger
            .record_archive(fingerprint, ArchiveStatus::Repacking, source, None)?;
        let scratch = ctx.root.scratch_dir(fingerprint.as_str());
        let output = ctx.root.output_path_for(source);

        let repacked = {
            let src = source.to_path_buf();
            let out_dir = scratch.join("out");
            let target = output.clone();
            run_blocking(&scratch, move || repack_stage(&src, &out_dir, &target)).await
        };
        if let Err(err) = repacked {
            let quarantine = matches!(err, BusError::ArchiveCorrupt { .. });
            return self
                .fail_archive(
                    ctx,
                    fingerprint,
                    source,
                    err.to_string(),
                    quarantine,
                    images_succeeded,
                    failed.len(),
                )
                .await;
        }

        ctx.ledger
            .record_archive(fingerprint, ArchiveStatus::Done, source, None)?;
        self.dispose_scratch(ctx, &scratch).await;
        info!(
            source = %source.display(),
            output = %output.display(),
            images = images_succeeded,
            "archive done"
        );
        Ok(ArchiveReport {
            fingerprint: fingerprint.clone(),
            source: source.to_path_buf(),
            outcome: ArchiveOutcome::Done,
            images_succeeded,
            images_failed: failed.len(),
            error: None,
        })
    }

    /// Terminal failure: durably record Failed first, then clean up.
    #[allow(clippy::too_many_arguments)]
    async fn fail_archive(
        &self,
        ctx: &RootContext,
        fingerprint: &Fingerprint,
        source: &Path,
        detail: String,
        quarantine: bool,
        images_succeeded: usize,
        images_failed: usize,
    ) -> Result<ArchiveReport, BusError> {
        ctx.ledger
            .record_archive(fingerprint, ArchiveStatus::Failed, source, Some(&detail))?;
        warn!(source = %source.display(), detail, "archive failed");

        let scratch = ctx.root.scratch_dir(fingerprint.as_str());
        self.dispose_scratch(ctx, &scratch).await;
        if quarantine && self.cfg.quarantine_corrupt {
            quarantine_source(source);
        }

        Ok(ArchiveReport {
            fingerprint: fingerprint.clone(),
            source: source.to_path_buf(),
            outcome: ArchiveOutcome::Failed,
            images_succeeded,
            images_failed,
            error: Some(detail),
        })
    }

    async fn dispose_scratch(&self, ctx: &RootContext, scratch: &Path) {
        let disposer = Arc::clone(&ctx.disposer);
        let path = scratch.to_path_buf();
        if let Err(err) = run_blocking(scratch, move || disposer.remove(&path)).await {
            warn!(path = %scratch.display(), %err, "failed to dispose scratch");
        }
    }
}

/// Verify, wipe scratch, extract, and copy non-image entries straight to
/// the output side. Idempotent per attempt: each retry starts from a fresh
/// scratch tree.
fn extract_stage(
    cfg: &BusConfig,
    source: &Path,
    scratch: &Path,
) -> Result<Vec<ArchiveEntry>, BusError> {
    retry_io("extract", || {
        archive::verify(source)?;
        if scratch.exists() {
            std::fs::remove_dir_all(scratch).map_err(|e| BusError::io(scratch, e))?;
        }
        let in_dir = scratch.join("in");
        let out_dir = scratch.join("out");
        std::fs::create_dir_all(&out_dir).map_err(|e| BusError::io(&out_dir, e))?;

        let entries = archive::extract_to(source, &in_dir)?;
        for entry in &entries {
            if cfg.is_image_entry(&entry.name) {
                continue;
            }
            let from = in_dir.join(&entry.name);
            let to = out_dir.join(&entry.name);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|e| BusError::io(parent, e))?;
            }
            std::fs::copy(&from, &to).map_err(|e| BusError::io(&from, e))?;
        }
        Ok(entries)
    })
}

/// The source is unmodified (same fingerprint), so listing it again
/// reproduces the original entry order even across a crash and restart.
fn repack_stage(source: &Path, out_dir: &Path, output: &Path) -> Result<(), BusError> {
    retry_io("repack", || {
        let entries = archive::list_entries(source)?;
        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        archive::create_from(out_dir, &names, output)
    })
}

/// Best-effort policy: failed entries ride along as their unprocessed
/// originals. Skips entries already present so a resumed run can repeat
/// this safely.
fn carry_over_originals(scratch: &Path, entries: &[String]) -> Result<(), BusError> {
    retry_io("carry-over", || {
        for entry in entries {
            let to = scratch.join("out").join(entry);
            if to.exists() {
                continue;
            }
            let from = scratch.join("in").join(entry);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|e| BusError::io(parent, e))?;
            }
            std::fs::copy(&from, &to).map_err(|e| BusError::io(&from, e))?;
        }
        Ok(())
    })
}

fn quarantine_source(source: &Path) {
    let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let target = source.with_file_name(format!("{name}.tdel"));
    match std::fs::rename(source, &target) {
        Ok(()) => info!(
            source = %source.display(),
            quarantined = %target.display(),
            "quarantined corrupt source"
        ),
        Err(err) => {
            warn!(source = %source.display(), %err, "failed to quarantine corrupt source");
        }
    }
}

fn interrupted_report(
    fingerprint: &Fingerprint,
    source: &Path,
    images_succeeded: usize,
    images_failed: usize,
) -> ArchiveReport {
    ArchiveReport {
        fingerprint: fingerprint.clone(),
        source: source.to_path_buf(),
        outcome: ArchiveOutcome::Interrupted,
        images_succeeded,
        images_failed,
        error: None,
    }
}

/// Transient I/O gets a couple of retries; corruption and everything else
/// fails straight through.
fn retry_io<T>(stage: &str, mut op: impl FnMut() -> Result<T, BusError>) -> Result<T, BusError> {
    let mut retries = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_stage_retryable() && retries < STAGE_RETRY_MAX => {
                retries += 1;
                warn!(stage, retries, %err, "stage I/O error, retrying");
                std::thread::sleep(STAGE_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

async fn run_blocking<T>(
    path: &Path,
    op: impl FnOnce() -> Result<T, BusError> + Send + 'static,
) -> Result<T, BusError>
where
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => result,
        Err(err) => Err(BusError::io(path, io::Error::other(err))),
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn retry_io_retries_transient_io_only() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, BusError> = retry_io("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(BusError::io(
                    Path::new("/x"),
                    io::Error::other("transient"),
                ))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<(), BusError> = retry_io("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BusError::corrupt(Path::new("/x"), "bad"))
        });
        assert!(matches!(result, Err(BusError::ArchiveCorrupt { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_retry_budget_is_exhausted_then_fails() {
        let calls = AtomicU32::new(0);
        let result: Result<(), BusError> = retry_io("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BusError::io(Path::new("/x"), io::Error::other("down")))
        });
        assert!(matches!(result, Err(BusError::Io { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1 + STAGE_RETRY_MAX);
    }

    #[test]
    fn carry_over_skips_entries_already_present() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path();
        fs::create_dir_all(scratch.join("in/sub")).unwrap();
        fs::create_dir_all(scratch.join("out")).unwrap();
        fs::write(scratch.join("in/sub/a.png"), b"original-a").unwrap();
        fs::write(scratch.join("in/b.png"), b"original-b").unwrap();
        fs::create_dir_all(scratch.join("out")).unwrap();
        fs::write(scratch.join("out/b.png"), b"already-there").unwrap();

        carry_over_originals(scratch, &["sub/a.png".to_string(), "b.png".to_string()]).unwrap();

        assert_eq!(fs::read(scratch.join("out/sub/a.png")).unwrap(), b"original-a");
        // An existing output is never clobbered by a carry-over.
        assert_eq!(fs::read(scratch.join("out/b.png")).unwrap(), b"already-there");
    }

    #[test]
    fn quarantine_appends_the_marker_suffix() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.zip");
        fs::write(&source, b"junk").unwrap();

        quarantine_source(&source);

        assert!(!source.exists());
        assert!(dir.path().join("broken.zip.tdel").exists());
    }
}

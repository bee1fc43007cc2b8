//! End-of-run accounting.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveOutcome {
    Done,
    Failed,
    /// Dedupe hit: this fingerprint already reached a terminal state.
    Skipped,
    /// Cancelled mid-run with a non-terminal ledger state; the next run
    /// resumes it.
    Interrupted,
}

/// What one archive's trip through the pipeline produced.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub fingerprint: Fingerprint,
    pub source: PathBuf,
    pub outcome: ArchiveOutcome,
    pub images_succeeded: usize,
    pub images_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArchiveReport {
    pub fn skipped(fingerprint: Fingerprint, source: PathBuf) -> ArchiveReport {
        ArchiveReport {
            fingerprint,
            source,
            outcome: ArchiveOutcome::Skipped,
            images_succeeded: 0,
            images_failed: 0,
            error: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub archives_done: usize,
    pub archives_failed: usize,
    pub archives_skipped: usize,
    pub archives_interrupted: usize,
    pub images_succeeded: usize,
    pub images_failed: usize,
    /// Images carried over unprocessed under the best-effort policy.
    pub carried_over: usize,
}

impl RunSummary {
    pub fn absorb(&mut self, report: &ArchiveReport) {
        match report.outcome {
            ArchiveOutcome::Done => self.archives_done += 1,
            ArchiveOutcome::Failed => self.archives_failed += 1,
            ArchiveOutcome::Skipped => self.archives_skipped += 1,
            ArchiveOutcome::Interrupted => self.archives_interrupted += 1,
        }
        self.images_succeeded += report.images_succeeded;
        self.images_failed += report.images_failed;
        if report.outcome == ArchiveOutcome::Done {
            self.carried_over += report.images_failed;
        }
    }

    /// 0 when every processed archive reached Done, 1 otherwise. An
    /// interruption is not a failure; those archives resume next run.
    pub fn exit_code(&self) -> u8 {
        if self.archives_failed > 0 { 1 } else { 0 }
    }

    pub fn log(&self, elapsed: Duration) {
        info!(
            done = self.archives_done,
            failed = self.archives_failed,
            skipped = self.archives_skipped,
            interrupted = self.archives_interrupted,
            images_succeeded = self.images_succeeded,
            images_failed = self.images_failed,
            carried_over = self.carried_over,
            elapsed_s = elapsed.as_secs_f64(),
            "run complete"
        );
    }
}

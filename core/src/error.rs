//! Failure taxonomy for the bus.
//!
//! Every fallible operation in this crate reports one of these variants so
//! callers can tell recoverable trouble apart from fatal trouble:
//!
//! - [`BusError::ArchiveCorrupt`] — the container itself is bad; the archive
//!   fails immediately, no retry.
//! - [`BusError::Io`] — filesystem trouble during a stage; retried at the
//!   stage level a fixed number of times, then the archive fails.
//! - [`BusError::Processing`] — one image failed; isolated to that image and
//!   governed by the per-image retry budget.
//! - [`BusError::LedgerIo`] — the progress store cannot be written; the
//!   process cannot safely continue and must exit.
//! - [`BusError::RecoveryInconsistent`] — persisted state and the filesystem
//!   disagree at startup; the archive fails and needs re-extraction.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Number of times a stage-level I/O failure is retried before the archive
/// is marked failed.
pub const STAGE_RETRY_MAX: u32 = 2;

#[derive(Debug, Error)]
pub enum BusError {
    /// The archive container cannot be parsed or fails its integrity check.
    #[error("corrupt archive {path}: {detail}")]
    ArchiveCorrupt { path: PathBuf, detail: String },

    /// A filesystem operation failed outside the ledger.
    #[error("I/O failure on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The external processor failed for a single image entry.
    #[error("processing failed for {entry}: {detail}")]
    Processing { entry: String, detail: String },

    /// The progress ledger cannot be read or written durably.
    #[error("ledger I/O failure on {path}")]
    LedgerIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Ledger state and the scratch tree disagree during startup recovery.
    #[error("recovery found inconsistent state for {fingerprint}: {detail}")]
    RecoveryInconsistent { fingerprint: String, detail: String },
}

impl BusError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BusError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        BusError::ArchiveCorrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn ledger(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BusError::LedgerIo {
            path: path.into(),
            source,
        }
    }

    /// Whether a stage (extract, repack) may be re-attempted after this
    /// error. Only plain I/O trouble qualifies; corruption and ledger
    /// failures never do.
    pub fn is_stage_retryable(&self) -> bool {
        matches!(self, BusError::Io { .. })
    }

    /// Whether the whole process must stop: nothing can run safely once
    /// progress can no longer be recorded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::LedgerIo { .. })
    }

    /// Short stable label used in log lines and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::ArchiveCorrupt { .. } => "archive-corrupt",
            BusError::Io { .. } => "io",
            BusError::Processing { .. } => "processing",
            BusError::LedgerIo { .. } => "ledger-io",
            BusError::RecoveryInconsistent { .. } => "recovery-inconsistent",
        }
    }
}

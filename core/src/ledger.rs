//! Durable progress ledger.
//!
//! One ledger lives in each root's state directory as an append-only JSONL
//! file: one JSON record per line, each carrying a monotonically increasing
//! sequence number, a timestamp, the archive fingerprint, and either an
//! archive-status event or an image-status event. Recovery folds the whole
//! file into per-fingerprint state with last-write-wins ordering by
//! sequence number, so a record is never edited in place and a torn final
//! line from a crash is simply skipped on load.
//!
//! Appends are serialized by an internal mutex, flushed with `sync_data`
//! before the call returns, and guarded across processes by an advisory
//! lock file held for the ledger's lifetime. Any storage error here is
//! [`BusError::LedgerIo`], which callers must treat as fatal: the bus
//! cannot run without durable progress tracking.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::DateTime;
use chrono::Utc;
use fs2::FileExt;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::config::RootConfig;
use crate::error::BusError;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveStatus {
    Discovered,
    Extracting,
    Dispatched,
    Repacking,
    Done,
    Failed,
}

impl ArchiveStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ArchiveStatus::Done | ArchiveStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl ImageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImageStatus::Succeeded | ImageStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LedgerEvent {
    Archive {
        status: ArchiveStatus,
        source: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Image {
        entry: String,
        status: ImageStatus,
        retries: u32,
    },
}

/// One persisted line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub event: LedgerEvent,
}

/// Folded view of everything the ledger knows about one archive.
#[derive(Debug, Clone)]
pub struct ArchiveState {
    pub fingerprint: Fingerprint,
    pub source: PathBuf,
    pub status: ArchiveStatus,
    pub error: Option<String>,
    pub images: BTreeMap<String, ImageState>,
    pub last_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    pub status: ImageStatus,
    pub retries: u32,
}

impl ArchiveState {
    fn new(fingerprint: Fingerprint) -> ArchiveState {
        ArchiveState {
            fingerprint,
            source: PathBuf::new(),
            status: ArchiveStatus::Discovered,
            error: None,
            images: BTreeMap::new(),
            last_seq: 0,
        }
    }

    /// Entries that still need a worker on resume: anything not yet
    /// succeeded and not failed past its retry budget. Returns each entry
    /// with the retry count the next attempt continues from.
    pub fn pending_entries(&self, retry_max: u32) -> Vec<(String, u32)> {
        self.images
            .iter()
            .filter_map(|(entry, state)| match state.status {
                ImageStatus::Succeeded => None,
                ImageStatus::Failed if state.retries >= retry_max => None,
                _ => Some((entry.clone(), state.retries)),
            })
            .collect()
    }

    pub fn succeeded_entries(&self) -> Vec<String> {
        self.images
            .iter()
            .filter(|(_, state)| state.status == ImageStatus::Succeeded)
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    /// Entries failed with no retry budget left. A Failed record below the
    /// budget was a cancelled attempt and still counts as pending.
    pub fn permanently_failed_entries(&self, retry_max: u32) -> Vec<String> {
        self.images
            .iter()
            .filter(|(_, state)| {
                state.status == ImageStatus::Failed && state.retries >= retry_max
            })
            .map(|(entry, _)| entry.clone())
            .collect()
    }
}

#[derive(Debug)]
struct LedgerInner {
    file: File,
    next_seq: u64,
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    inner: Mutex<LedgerInner>,
    // Advisory lock released when the ledger is dropped.
    _lock_file: File,
}

impl Ledger {
    /// Open (creating if needed) the ledger for one root, taking the
    /// exclusive advisory lock so a second bus on the same root fails fast
    /// instead of interleaving writes.
    pub fn open(root: &RootConfig) -> Result<Ledger, BusError> {
        let state_dir = root.state_dir();
        for dir in [
            &state_dir,
            &state_dir.join("scratch"),
            &root.trash_dir(),
        ] {
            std::fs::create_dir_all(dir).map_err(|e| BusError::ledger(dir, e))?;
        }

        let lock_path = state_dir.join("ledger.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| BusError::ledger(&lock_path, e))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|e| BusError::ledger(&lock_path, e))?;

        let path = root.ledger_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BusError::ledger(&path, e))?;

        let next_seq = match load_events_from(&path) {
            Ok(records) => records.iter().map(|r| r.seq).max().unwrap_or(0) + 1,
            Err(err) => return Err(err),
        };

        Ok(Ledger {
            path,
            inner: Mutex::new(LedgerInner { file, next_seq }),
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_archive(
        &self,
        fingerprint: &Fingerprint,
        status: ArchiveStatus,
        source: &Path,
        error: Option<&str>,
    ) -> Result<u64, BusError> {
        self.append(fingerprint, LedgerEvent::Archive {
            status,
            source: source.to_path_buf(),
            error: error.map(str::to_string),
        })
    }

    pub fn record_image(
        &self,
        fingerprint: &Fingerprint,
        entry: &str,
        status: ImageStatus,
        retries: u32,
    ) -> Result<u64, BusError> {
        self.append(fingerprint, LedgerEvent::Image {
            entry: entry.to_string(),
            status,
            retries,
        })
    }

    fn append(&self, fingerprint: &Fingerprint, event: LedgerEvent) -> Result<u64, BusError> {
        let mut inner = lock_or_recover(&self.inner);
        let seq = inner.next_seq;
        let record = LedgerRecord {
            seq,
            at: Utc::now(),
            fingerprint: fingerprint.clone(),
            event,
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| BusError::ledger(&self.path, std::io::Error::other(e)))?;
        line.push('\n');
        inner
            .file
            .write_all(line.as_bytes())
            .map_err(|e| BusError::ledger(&self.path, e))?;
        inner
            .file
            .sync_data()
            .map_err(|e| BusError::ledger(&self.path, e))?;
        inner.next_seq = seq + 1;
        Ok(seq)
    }

    /// Every parseable record, in file order. Unparseable lines (a torn
    /// tail from a crash) are skipped with a warning.
    pub fn load_events(&self) -> Result<Vec<LedgerRecord>, BusError> {
        load_events_from(&self.path)
    }

    /// Fold the whole file into per-fingerprint state. Records are applied
    /// in sequence order, so the last write for any fact wins.
    pub fn load_all(&self) -> Result<HashMap<Fingerprint, ArchiveState>, BusError> {
        let mut records = self.load_events()?;
        records.sort_by_key(|r| r.seq);

        let mut states: HashMap<Fingerprint, ArchiveState> = HashMap::new();
        for record in records {
            let state = states
                .entry(record.fingerprint.clone())
                .or_insert_with(|| ArchiveState::new(record.fingerprint.clone()));
            state.last_seq = record.seq;
            match record.event {
                LedgerEvent::Archive {
                    status,
                    source,
                    error,
                } => {
                    state.status = status;
                    state.source = source;
                    state.error = error;
                }
                LedgerEvent::Image {
                    entry,
                    status,
                    retries,
                } => {
                    state.images.insert(entry, ImageState { status, retries });
                }
            }
        }
        Ok(states)
    }
}

fn load_events_from(path: &Path) -> Result<Vec<LedgerRecord>, BusError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| BusError::ledger(path, e))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| BusError::ledger(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    %err,
                    "skipping unparseable ledger line"
                );
            }
        }
    }
    Ok(records)
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

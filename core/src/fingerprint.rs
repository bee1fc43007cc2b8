//! Archive identity.
//!
//! A fingerprint is the ledger key for one archive: the SHA-256 of the
//! canonical source path plus the file's size and mtime. Editing or
//! replacing a source therefore yields a fresh identity, while an untouched
//! file keeps the same one across runs — which is what makes resume and
//! already-done detection safe.

use std::fmt;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::BusError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a source archive from its canonical path and metadata.
    ///
    /// Fails with [`BusError::Io`] when the file cannot be stat'ed, which
    /// callers treat the same as the file having vanished.
    pub fn of_file(path: &Path) -> Result<Fingerprint, BusError> {
        let canonical = std::fs::canonicalize(path).map_err(|e| BusError::io(path, e))?;
        let meta = std::fs::metadata(&canonical).map_err(|e| BusError::io(path, e))?;
        let (mtime_secs, mtime_nanos) = meta
            .modified()
            .map_err(|e| BusError::io(path, e))?
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_secs(), d.subsec_nanos()))
            .unwrap_or((0, 0));

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_os_str().as_encoded_bytes());
        hasher.update(meta.len().to_le_bytes());
        hasher.update(mtime_secs.to_le_bytes());
        hasher.update(mtime_nanos.to_le_bytes());
        Ok(Fingerprint(format!("{:x}", hasher.finalize())))
    }

    /// Rebuild a fingerprint from its stored hex form (ledger load).
    pub fn from_hex(hex: impl Into<String>) -> Fingerprint {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use pretty_assertions::assert_ne;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn unchanged_file_keeps_its_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol1.zip");
        fs::write(&path, b"archive bytes").unwrap();

        let a = Fingerprint::of_file(&path).unwrap();
        let b = Fingerprint::of_file(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn rewriting_the_file_changes_the_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol1.zip");
        fs::write(&path, b"first").unwrap();
        let before = Fingerprint::of_file(&path).unwrap();

        // A replaced file differs in size; mtime alone is too coarse to
        // rely on within one test.
        fs::write(&path, b"second, longer").unwrap();
        let after = Fingerprint::of_file(&path).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn different_paths_have_different_fingerprints() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();
        assert_ne!(
            Fingerprint::of_file(&a).unwrap(),
            Fingerprint::of_file(&b).unwrap()
        );
    }

    #[test]
    fn missing_file_reports_io() {
        let dir = TempDir::new().unwrap();
        let err = Fingerprint::of_file(&dir.path().join("gone.zip")).unwrap_err();
        assert!(matches!(err, BusError::Io { .. }));
    }
}

//! Archive container access.
//!
//! Containers are opaque ZIP-family files (`.zip`, `.cbz`). This module
//! exposes exactly the four operations the pipeline needs — list, verify,
//! extract, create — and nothing about the codec leaks past it.
//!
//! Entry order is the container's native order and `list_entries` is
//! restartable: for an unmodified file it always returns the same sequence,
//! which is what lets a resumed run rebuild the repack order without
//! persisting it. `create_from` writes to a `.tmp` sibling and renames into
//! place so a crash never leaves a half-written archive under the final
//! name; an existing file at the destination is first renamed to a
//! timestamped `.bak` sibling.

use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use chrono::Utc;
use tracing::debug;
use zip::CompressionMethod;
use zip::ZipArchive;
use zip::ZipWriter;
use zip::result::ZipError;
use zip::write::FileOptions;

use crate::error::BusError;

/// One file entry inside a container, in native order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Entry name as stored, `/`-separated.
    pub name: String,
    /// Uncompressed size in bytes.
    pub size: u64,
}

/// Deterministic listing of the container's file entries (directories are
/// not reported).
pub fn list_entries(archive_path: &Path) -> Result<Vec<ArchiveEntry>, BusError> {
    let mut archive = open_archive(archive_path)?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| zip_error(archive_path, e))?;
        if entry.is_dir() {
            continue;
        }
        entries.push(ArchiveEntry {
            name: entry.name().to_string(),
            size: entry.size(),
        });
    }
    Ok(entries)
}

/// Integrity pass: walks every entry and reads it to the end, which checks
/// each stored CRC. Cheap enough to run at discovery time.
pub fn verify(archive_path: &Path) -> Result<(), BusError> {
    let mut archive = open_archive(archive_path)?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| zip_error(archive_path, e))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        io::copy(&mut entry, &mut io::sink()).map_err(|e| read_error(archive_path, &name, e))?;
    }
    Ok(())
}

/// Unpack every file entry into `dest`, preserving relative paths. `dest`
/// must be a fresh directory owned by the caller. Returns the entries in
/// container order.
pub fn extract_to(archive_path: &Path, dest: &Path) -> Result<Vec<ArchiveEntry>, BusError> {
    std::fs::create_dir_all(dest).map_err(|e| BusError::io(dest, e))?;
    let mut archive = open_archive(archive_path)?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| zip_error(archive_path, e))?;
        let name = entry.name().to_string();
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(BusError::corrupt(
                archive_path,
                format!("entry escapes the archive root: {name}"),
            ));
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| BusError::io(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BusError::io(parent, e))?;
        }
        let mut out = File::create(&target).map_err(|e| BusError::io(&target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| read_error(archive_path, &name, e))?;
        entries.push(ArchiveEntry {
            name,
            size: entry.size(),
        });
    }
    debug!(
        archive = %archive_path.display(),
        entries = entries.len(),
        "extracted archive"
    );
    Ok(entries)
}

/// Pack `entries` (paths relative to `src_dir`, written in the given order)
/// into a new archive at `output_path`, atomically.
pub fn create_from(src_dir: &Path, entries: &[String], output_path: &Path) -> Result<(), BusError> {
    let Some(parent) = output_path.parent() else {
        return Err(BusError::io(
            output_path,
            io::Error::other("output path has no parent directory"),
        ));
    };
    std::fs::create_dir_all(parent).map_err(|e| BusError::io(parent, e))?;

    let tmp_path = sibling_with_suffix(output_path, "tmp")?;
    let result = write_archive(src_dir, entries, &tmp_path);
    if result.is_err() {
        // Never leave a stale temp file behind a failed repack.
        let _ = std::fs::remove_file(&tmp_path);
        return result;
    }

    if output_path.exists() {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup = sibling_with_suffix(output_path, &format!("{stamp}.bak"))?;
        std::fs::rename(output_path, &backup).map_err(|e| BusError::io(output_path, e))?;
        debug!(backup = %backup.display(), "backed up existing output");
    }
    std::fs::rename(&tmp_path, output_path).map_err(|e| BusError::io(output_path, e))
}

fn write_archive(src_dir: &Path, entries: &[String], tmp_path: &Path) -> Result<(), BusError> {
    let file = File::create(tmp_path).map_err(|e| BusError::io(tmp_path, e))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for name in entries {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| zip_error(tmp_path, e))?;
        let source = src_dir.join(name);
        let mut input = File::open(&source).map_err(|e| BusError::io(&source, e))?;
        io::copy(&mut input, &mut writer).map_err(|e| BusError::io(&source, e))?;
    }

    let file = writer.finish().map_err(|e| zip_error(tmp_path, e))?;
    // Make the bytes durable before the rename publishes them.
    file.sync_all().map_err(|e| BusError::io(tmp_path, e))?;
    Ok(())
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> Result<PathBuf, BusError> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Err(BusError::io(
            path,
            io::Error::other("output file name is not valid UTF-8"),
        ));
    };
    Ok(path.with_file_name(format!("{name}.{suffix}")))
}

fn open_archive(archive_path: &Path) -> Result<ZipArchive<File>, BusError> {
    let file = File::open(archive_path).map_err(|e| BusError::io(archive_path, e))?;
    ZipArchive::new(file).map_err(|e| zip_error(archive_path, e))
}

fn zip_error(path: &Path, err: ZipError) -> BusError {
    match err {
        ZipError::Io(source) => BusError::io(path, source),
        ZipError::InvalidArchive(detail) | ZipError::UnsupportedArchive(detail) => {
            BusError::corrupt(path, detail)
        }
        ZipError::FileNotFound => BusError::corrupt(path, "entry missing from archive"),
    }
}

/// Read failures inside an entry are corruption when the payload is bad
/// and plain I/O otherwise. CRC mismatches come back from the zip reader as
/// opaque errors, so the message is part of the check.
fn read_error(path: &Path, entry: &str, err: io::Error) -> BusError {
    let payload_bad = matches!(
        err.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
    ) || err.to_string().to_lowercase().contains("checksum");
    if payload_bad {
        BusError::corrupt(path, format!("bad data in entry {entry}: {err}"))
    } else {
        BusError::io(path, err)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        write_zip_with(path, entries, CompressionMethod::Deflated);
    }

    fn write_zip_with(path: &Path, entries: &[(&str, &[u8])], method: CompressionMethod) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(method);
        for (name, bytes) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn list_preserves_container_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.zip");
        write_zip(&path, &[
            ("010.png", b"ten"),
            ("001.png", b"one"),
            ("notes/readme.txt", b"hi"),
        ]);

        let entries = list_entries(&path).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["010.png", "001.png", "notes/readme.txt"]);
        assert_eq!(entries[0].size, 3);
    }

    #[test]
    fn extract_then_create_round_trips() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("vol.zip");
        write_zip(&source, &[
            ("b.png", b"bytes-b"),
            ("a.png", b"bytes-a"),
            ("sub/c.png", b"bytes-c"),
        ]);

        let scratch = dir.path().join("scratch");
        let entries = extract_to(&source, &scratch).unwrap();
        assert_eq!(fs::read(scratch.join("sub/c.png")).unwrap(), b"bytes-c");

        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        let output = dir.path().join("out/vol.zip");
        create_from(&scratch, &names, &output).unwrap();

        let repacked = list_entries(&output).unwrap();
        assert_eq!(
            repacked.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["b.png", "a.png", "sub/c.png"]
        );
        let rescratch = dir.path().join("rescratch");
        extract_to(&output, &rescratch).unwrap();
        assert_eq!(fs::read(rescratch.join("a.png")).unwrap(), b"bytes-a");
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.zip");
        fs::write(&path, b"this is not a zip file at all").unwrap();

        assert!(matches!(
            list_entries(&path).unwrap_err(),
            BusError::ArchiveCorrupt { .. }
        ));
        assert!(matches!(
            verify(&path).unwrap_err(),
            BusError::ArchiveCorrupt { .. }
        ));
    }

    #[test]
    fn verify_catches_a_flipped_payload_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.zip");
        let payload = b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        // Stored entries keep the payload verbatim so the test can find it.
        write_zip_with(&path, &[("001.png", payload)], CompressionMethod::Stored);
        assert!(verify(&path).is_ok());

        let mut raw = fs::read(&path).unwrap();
        let pos = raw
            .windows(payload.len())
            .position(|w| w == payload)
            .unwrap();
        raw[pos] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(matches!(
            verify(&path).unwrap_err(),
            BusError::ArchiveCorrupt { .. }
        ));
    }

    #[test]
    fn extract_refuses_entries_that_escape_the_destination() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("evil.zip");
        write_zip(&path, &[("../evil.bin", b"nope")]);

        let scratch = dir.path().join("scratch");
        let err = extract_to(&path, &scratch).unwrap_err();
        assert!(matches!(err, BusError::ArchiveCorrupt { .. }));
        assert!(!dir.path().join("evil.bin").exists());
    }

    #[test]
    fn create_is_atomic_and_backs_up_an_existing_output() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("001.png"), b"new bytes").unwrap();

        let output = dir.path().join("out/vol.zip");
        fs::create_dir_all(output.parent().unwrap()).unwrap();
        fs::write(&output, b"old output").unwrap();

        create_from(&scratch, &["001.png".to_string()], &output).unwrap();

        let listing: Vec<String> = fs::read_dir(output.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!listing.iter().any(|n| n.ends_with(".tmp")), "{listing:?}");
        let backups: Vec<&String> = listing.iter().filter(|n| n.ends_with(".bak")).collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            fs::read(output.parent().unwrap().join(backups[0])).unwrap(),
            b"old output"
        );
        assert_eq!(list_entries(&output).unwrap().len(), 1);
    }

    #[test]
    fn failed_create_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();

        let output = dir.path().join("out/vol.zip");
        // Entry file is missing from scratch, so packing fails.
        let err = create_from(&scratch, &["missing.png".to_string()], &output).unwrap_err();
        assert!(matches!(err, BusError::Io { .. }));
        assert!(!output.exists());
        let leftovers: Vec<_> = fs::read_dir(output.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}

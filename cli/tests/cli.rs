//! End-to-end checks of the `upscalebus` binary.
//!
//! These run the real binary against real roots, with `cp` standing in for
//! an upscaler. Exit codes: 0 all done, 1 archives failed, 2 startup error.

use std::ffi::OsStr;
use std::fs;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use assert_cmd::cargo::CommandCargoExt;
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use zip::CompressionMethod;
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::FileOptions;

use upscalebus_core::config::RootConfig;
use upscalebus_core::events::EventListener;
use upscalebus_core::fingerprint::Fingerprint;
use upscalebus_core::ledger::ArchiveStatus;
use upscalebus_core::ledger::ImageStatus;
use upscalebus_core::ledger::Ledger;

fn upscalebus() -> Result<assert_cmd::Command> {
    Ok(assert_cmd::Command::cargo_bin("upscalebus")?)
}

fn write_config(dir: &Path, root: &Path, command: &str) -> Result<PathBuf> {
    let path = dir.join("bus.toml");
    fs::write(
        &path,
        format!(
            "[[roots]]\npath = \"{}\"\n\n[processor]\ncommand = \"{command}\"\n",
            root.display()
        ),
    )?;
    Ok(path)
}

fn build_zip(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(bytes)?;
    }
    writer.finish()?;
    Ok(())
}

fn read_zip(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = File::open(path)?;
    let mut zip = ZipArchive::new(file)?;
    let mut entries = Vec::new();
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        entries.push((entry.name().to_string(), bytes));
    }
    Ok(entries)
}

fn output_names(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_>>()?;
    names.sort();
    Ok(names)
}

#[test]
fn help_lists_the_subcommands() -> Result<()> {
    upscalebus()?.arg("--help").assert().success().stdout(
        predicate::str::contains("run")
            .and(predicate::str::contains("monitor"))
            .and(predicate::str::contains("recover")),
    );
    Ok(())
}

#[test]
fn run_refuses_to_start_without_roots() -> Result<()> {
    let output = upscalebus()?.args(["run", "--once"]).output()?;
    assert_eq!(
        output.status.code(),
        Some(2),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stderr).contains("at least one root"));
    Ok(())
}

#[test]
fn a_missing_config_file_is_a_startup_error() -> Result<()> {
    let output = upscalebus()?
        .args(["--config", "/nonexistent/bus.toml", "run", "--once"])
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("failed to read config file"),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

#[test]
fn run_once_over_an_empty_root_exits_clean() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("library");
    fs::create_dir_all(&root)?;
    let config = write_config(dir.path(), &root, "cp")?;

    let output = upscalebus()?
        .arg("--config")
        .arg(&config)
        .args(["run", "--once"])
        .output()?;
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    // Even an empty run lays down its per-root state directory.
    assert!(root.join(".upscalebus/ledger.jsonl").exists());
    Ok(())
}

#[test]
fn run_once_processes_a_real_archive_end_to_end() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("library");
    fs::create_dir_all(&root)?;
    build_zip(&root.join("vol1.cbz"), &[
        ("001.png", b"pix-one"),
        ("notes.txt", b"keep"),
    ])?;
    let config = write_config(dir.path(), &root, "cp")?;

    let output = upscalebus()?
        .arg("--config")
        .arg(&config)
        .args(["run", "--once"])
        .output()?;
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // `cp` as the processor means output bytes match the originals.
    let entries = read_zip(&root.join("upscaled/vol1.cbz"))?;
    assert_eq!(entries, vec![
        ("001.png".to_string(), b"pix-one".to_vec()),
        ("notes.txt".to_string(), b"keep".to_vec()),
    ]);

    // A second run finds the fingerprint terminal and rewrites nothing:
    // no backup appears next to the output.
    let output = upscalebus()?
        .arg("--config")
        .arg(&config)
        .args(["run", "--once"])
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(output_names(&root.join("upscaled"))?, vec!["vol1.cbz"]);
    Ok(())
}

#[test]
fn a_permanently_failing_processor_fails_the_archive() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("library");
    fs::create_dir_all(&root)?;
    build_zip(&root.join("vol2.zip"), &[("001.png", b"pix")])?;
    let config = write_config(dir.path(), &root, "false")?;

    let output = upscalebus()?
        .arg("--config")
        .arg(&config)
        .args(["run", "--once", "--retry-max", "0"])
        .output()?;
    assert_eq!(
        output.status.code(),
        Some(1),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(!root.join("upscaled/vol2.zip").exists());
    // A processing failure is not corruption; the source stays put.
    assert!(root.join("vol2.zip").exists());
    Ok(())
}

#[tokio::test]
async fn monitor_delivers_discoveries_once_a_bus_listens() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("library");
    fs::create_dir_all(&root)?;
    build_zip(&root.join("vol1.cbz"), &[("001.png", b"pix")])?;
    let socket = dir.path().join("bus.sock");

    // No bus is listening yet: the monitor's first connects fail and it
    // backs off rather than exiting.
    let mut command = std::process::Command::cargo_bin("upscalebus")?;
    command
        .arg("monitor")
        .arg("--socket")
        .arg(&socket)
        .arg("--root")
        .arg(&root)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let mut child = command.spawn()?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Once a bus binds the socket, the backlog discovery arrives.
    let mut listener = EventListener::bind(&socket)?;
    let delivered = tokio::time::timeout(Duration::from_secs(15), listener.recv()).await;
    let _ = child.kill();
    child.wait()?;

    let delivered = delivered?;
    assert_eq!(
        delivered.as_deref().and_then(Path::file_name),
        Some(OsStr::new("vol1.cbz"))
    );
    Ok(())
}

#[test]
fn recover_reports_an_empty_ledger() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("library");
    fs::create_dir_all(&root)?;

    let output = upscalebus()?
        .args(["recover", "--root"])
        .arg(&root)
        .output()?;
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("0 archive(s)"));
    Ok(())
}

#[test]
fn recover_reports_a_crashed_archive_as_inconsistent_json() -> Result<()> {
    let dir = TempDir::new()?;
    let root_dir = dir.path().join("library");
    fs::create_dir_all(&root_dir)?;
    let source = root_dir.join("vol3.zip");
    fs::write(&source, b"recorded mid-run")?;

    // Seed a ledger that says Dispatched with no scratch to back it, as a
    // crash between extraction and the first image would leave it.
    {
        let root = RootConfig::new(&root_dir);
        let ledger = Ledger::open(&root)?;
        let fingerprint = Fingerprint::of_file(&source)?;
        ledger.record_archive(&fingerprint, ArchiveStatus::Dispatched, &source, None)?;
        ledger.record_image(&fingerprint, "001.png", ImageStatus::Succeeded, 0)?;
    }

    let output = upscalebus()?
        .args(["recover", "--json", "--root"])
        .arg(&root_dir)
        .output()?;
    assert_eq!(
        output.status.code(),
        Some(1),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // Logging goes to stderr, so stdout is parseable JSON.
    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report[0]["disposition"], "inconsistent");
    assert!(
        report[0]["detail"]
            .as_str()
            .unwrap_or_default()
            .contains("scratch"),
        "report: {report}"
    );
    Ok(())
}

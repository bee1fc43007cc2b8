//! `upscalebus recover`: run reconciliation standalone and report.
//!
//! Takes the same per-root ledger lock as the bus, so it refuses to run
//! against a root a live bus currently owns. Reconciliation is not a dry
//! run: inconsistent archives are recorded Failed and their scratch
//! disposed, exactly as `run` would at startup.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use upscalebus_core::BusConfig;
use upscalebus_core::config::RootConfig;
use upscalebus_core::disposer;
use upscalebus_core::ledger::Ledger;
use upscalebus_core::recovery;
use upscalebus_core::recovery::Disposition;
use upscalebus_core::recovery::RecoveredArchive;

#[derive(Debug, Parser)]
pub struct RecoverArgs {
    /// Root directory to reconcile; repeatable, adds to any configured roots.
    #[arg(long = "root", value_name = "DIR")]
    roots: Vec<PathBuf>,

    /// Emit the report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

pub async fn run(config_path: Option<&Path>, args: RecoverArgs) -> anyhow::Result<ExitCode> {
    let mut cfg = BusConfig::load(config_path).context("loading configuration")?;
    for path in &args.roots {
        if !cfg.roots.iter().any(|root| root.path == *path) {
            cfg.roots.push(RootConfig::new(path.clone()));
        }
    }
    cfg.validate_common()?;

    let mut report: Vec<RecoveredArchive> = Vec::new();
    for root in &cfg.roots {
        let ledger = Ledger::open(root)
            .with_context(|| format!("opening ledger for {}", root.path.display()))?;
        let disposer = disposer::for_root(root, cfg.disposal);
        let recovered = recovery::reconcile(&cfg, root, &ledger, disposer.as_ref())
            .with_context(|| format!("reconciling ledger for {}", root.path.display()))?;
        report.extend(recovered);
    }

    let inconsistent = report.iter().filter(|a| a.newly_failed()).count();

    if args.json {
        let rendered = serde_json::to_string_pretty(&report).context("serializing report")?;
        println!("{rendered}");
    } else {
        for archive in &report {
            println!("{}", describe(archive));
        }
        let resumable = report.iter().filter(|a| a.resumable().is_some()).count();
        let done = report
            .iter()
            .filter(|a| matches!(a.disposition, Disposition::AlreadyDone))
            .count();
        let failed = report
            .iter()
            .filter(|a| matches!(a.disposition, Disposition::AlreadyFailed { .. }))
            .count();
        println!(
            "{} archive(s): {resumable} resumable, {inconsistent} inconsistent, {done} already done, {failed} already failed",
            report.len()
        );
    }

    Ok(ExitCode::from(if inconsistent > 0 { 1 } else { 0 }))
}

fn describe(archive: &RecoveredArchive) -> String {
    let (tag, detail) = match &archive.disposition {
        Disposition::AlreadyDone => ("done", None),
        Disposition::AlreadyFailed { error } => ("failed", error.clone()),
        Disposition::Resumed {
            resume_from,
            pending,
            ..
        } => (
            "resumable",
            Some(format!(
                "from {resume_from:?}, {} image(s) pending",
                pending.len()
            )),
        ),
        Disposition::Inconsistent { detail } => ("inconsistent", Some(detail.clone())),
    };
    match detail {
        Some(detail) => format!("{tag:<12} {} ({detail})", archive.source.display()),
        None => format!("{tag:<12} {}", archive.source.display()),
    }
}

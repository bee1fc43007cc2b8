//! `upscalebus run`: the bus itself.
//!
//! Startup order is load-bearing: per root, open the ledger (taking the
//! exclusive lock), sweep orphaned temp files, reconcile recorded state and
//! spawn resumptions, then scan the backlog. Only after that does the
//! watcher feed new discoveries, so recovered archives are never raced by
//! a rediscovery of their own source.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use upscalebus_core::BusConfig;
use upscalebus_core::BusError;
use upscalebus_core::config::FailurePolicy;
use upscalebus_core::config::RootConfig;
use upscalebus_core::dispatch::Dispatcher;
use upscalebus_core::disposer;
use upscalebus_core::disposer::Disposer;
use upscalebus_core::events::EventListener;
use upscalebus_core::ledger::Ledger;
use upscalebus_core::monitor::Monitor;
use upscalebus_core::pipeline::Coordinator;
use upscalebus_core::pipeline::RootContext;
use upscalebus_core::processor::CommandProcessor;
use upscalebus_core::processor::ImageProcessor;
use upscalebus_core::recovery;
use upscalebus_core::report::ArchiveReport;
use upscalebus_core::report::RunSummary;
use upscalebus_core::scan;

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Root directory to process; repeatable, adds to any configured roots.
    #[arg(long = "root", value_name = "DIR")]
    roots: Vec<PathBuf>,

    /// Process the current backlog and exit instead of watching.
    #[arg(long)]
    once: bool,

    /// Keep watching after the backlog drains (the default).
    #[arg(long, conflicts_with = "once")]
    watch: bool,

    /// Override the worker pool size.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Override the per-image retry budget.
    #[arg(long, value_name = "N")]
    retry_max: Option<u32>,

    /// Override the failure policy: strict or best-effort.
    #[arg(long, value_name = "POLICY")]
    policy: Option<String>,

    /// Accept discovery events from standalone monitors on this socket.
    #[arg(long, value_name = "SOCKET")]
    listen: Option<PathBuf>,
}

pub async fn run(config_path: Option<&Path>, args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut cfg = BusConfig::load(config_path).context("loading configuration")?;
    for path in &args.roots {
        if !cfg.roots.iter().any(|root| root.path == *path) {
            cfg.roots.push(RootConfig::new(path.clone()));
        }
    }
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    if let Some(retry_max) = args.retry_max {
        cfg.retry_max = retry_max;
    }
    if let Some(policy) = &args.policy {
        cfg.failure_policy = parse_policy(policy)?;
    }
    cfg.validate_for_run()?;
    let cfg = Arc::new(cfg);

    let watching = args.watch || !args.once;
    if !watching && args.listen.is_some() {
        warn!("--listen has no effect with --once");
    }

    let started = Instant::now();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        roots = cfg.roots.len(),
        workers = cfg.workers,
        policy = ?cfg.failure_policy,
        "bus starting"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let processor: Arc<dyn ImageProcessor> =
        Arc::new(CommandProcessor::new(&cfg.processor, cfg.process_timeout()));
    let dispatcher = Arc::new(Dispatcher::new(
        cfg.workers,
        cfg.queue_capacity,
        cfg.retry_max,
        processor,
        cancel.clone(),
    ));
    let coordinator = Coordinator::new(Arc::clone(&cfg), Arc::clone(&dispatcher), cancel.clone());

    let mut summary = RunSummary::default();
    let mut tasks: JoinSet<Result<Option<ArchiveReport>, BusError>> = JoinSet::new();
    let mut contexts: Vec<Arc<RootContext>> = Vec::with_capacity(cfg.roots.len());

    for root in &cfg.roots {
        let ledger = Arc::new(
            Ledger::open(root)
                .with_context(|| format!("opening ledger for {}", root.path.display()))?,
        );
        let disposer: Arc<dyn Disposer> = Arc::from(disposer::for_root(root, cfg.disposal));
        scan::sweep_root(&cfg, root, disposer.as_ref());
        let ctx = Arc::new(RootContext {
            root: root.clone(),
            ledger,
            disposer,
        });

        let recovered = recovery::reconcile(&cfg, root, &ctx.ledger, ctx.disposer.as_ref())
            .with_context(|| format!("reconciling ledger for {}", root.path.display()))?;
        for archive in recovered {
            if archive.newly_failed() {
                // Reconciliation already recorded the failure durably; it
                // still counts against this run's exit code.
                summary.archives_failed += 1;
            }
            if archive.resumable().is_some() {
                let coordinator = coordinator.clone();
                let ctx = Arc::clone(&ctx);
                tasks.spawn(async move { coordinator.resume_archive(&ctx, &archive).await });
            } else {
                coordinator.mark_finished(archive.fingerprint.clone());
            }
        }

        contexts.push(ctx);
    }

    // The watcher starts before the backlog scan so an archive arriving
    // mid-scan cannot fall between the two; seeing a path twice is fine.
    let mut monitor = if watching {
        Some(Monitor::new(&cfg).context("starting filesystem watcher")?)
    } else {
        None
    };

    for ctx in &contexts {
        let found = scan::scan_root(&cfg, &ctx.root)
            .with_context(|| format!("scanning {}", ctx.root.path.display()))?;
        info!(root = %ctx.root.path.display(), backlog = found.len(), "initial scan");
        for source in found {
            spawn_process(&mut tasks, &coordinator, ctx, source);
        }
    }

    match monitor.take() {
        None => {
            while let Some(joined) = tasks.join_next().await {
                absorb_finished(&mut summary, joined, &cancel)?;
            }
        }
        Some(mut monitor) => {
            let mut listener = match &args.listen {
                Some(socket) => {
                    Some(EventListener::bind(socket).context("binding discovery socket")?)
                }
                None => None,
            };
            info!("watching for new archives; press Ctrl-C to stop");
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(joined) = tasks.join_next() => {
                        absorb_finished(&mut summary, joined, &cancel)?;
                    }
                    Some(path) = recv_event(&mut listener) => {
                        dispatch_discovery(&cfg, &contexts, &coordinator, &mut tasks, path);
                    }
                    _ = tick.tick() => {
                        if let Some(settled) = monitor.poll_settled() {
                            for path in settled {
                                dispatch_discovery(&cfg, &contexts, &coordinator, &mut tasks, path);
                            }
                        }
                    }
                }
            }
            // Cancelled: drain in-flight archives so each one checkpoints.
            while let Some(joined) = tasks.join_next().await {
                absorb_finished(&mut summary, joined, &cancel)?;
            }
        }
    }

    dispatcher.shutdown().await;
    summary.log(started.elapsed());
    Ok(ExitCode::from(summary.exit_code()))
}

/// First Ctrl-C cancels cooperatively; a second one aborts with the
/// conventional interrupt code.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("interrupt received, checkpointing in-flight archives; press again to abort");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, aborting immediately");
            std::process::exit(130);
        }
    });
}

fn parse_policy(text: &str) -> anyhow::Result<FailurePolicy> {
    match text {
        "strict" => Ok(FailurePolicy::Strict),
        "best-effort" => Ok(FailurePolicy::BestEffort),
        other => anyhow::bail!("unknown failure policy {other:?}; expected strict or best-effort"),
    }
}

fn spawn_process(
    tasks: &mut JoinSet<Result<Option<ArchiveReport>, BusError>>,
    coordinator: &Coordinator,
    ctx: &Arc<RootContext>,
    source: PathBuf,
) {
    let coordinator = coordinator.clone();
    let ctx = Arc::clone(ctx);
    tasks.spawn(async move { coordinator.process_archive(&ctx, &source).await });
}

/// Route a discovered path to the root that owns it. The watcher
/// pre-filters candidates but socket events may name anything, so
/// eligibility is re-checked here.
fn dispatch_discovery(
    cfg: &BusConfig,
    contexts: &[Arc<RootContext>],
    coordinator: &Coordinator,
    tasks: &mut JoinSet<Result<Option<ArchiveReport>, BusError>>,
    path: PathBuf,
) {
    let Some(ctx) = contexts
        .iter()
        .find(|ctx| path.starts_with(&ctx.root.path))
    else {
        warn!(path = %path.display(), "discovery outside any configured root");
        return;
    };
    if !scan::is_candidate(cfg, &ctx.root, &path) {
        return;
    }
    spawn_process(tasks, coordinator, ctx, path);
}

async fn recv_event(listener: &mut Option<EventListener>) -> Option<PathBuf> {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}

/// Fold one finished archive task into the summary. A task-level error is
/// a ledger failure, which is fatal for the whole run; everything else the
/// pipeline reports through [`ArchiveReport`].
fn absorb_finished(
    summary: &mut RunSummary,
    joined: Result<Result<Option<ArchiveReport>, BusError>, JoinError>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match joined {
        Ok(Ok(Some(report))) => {
            summary.absorb(&report);
            Ok(())
        }
        Ok(Ok(None)) => Ok(()),
        Ok(Err(err)) => {
            cancel.cancel();
            Err(err).context("archive task failed")
        }
        Err(err) if err.is_panic() => {
            cancel.cancel();
            Err(anyhow::anyhow!(err)).context("archive task panicked")
        }
        Err(_) => Ok(()),
    }
}
